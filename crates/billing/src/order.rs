//! Billing profile submitted when subscribing or updating customer data.

use quill_shared::SubscriptionPlan;

use crate::error::{BillingError, BillingResult, FieldError};

/// Billing profile and plan selection as submitted by an organization admin.
///
/// [`Order::validate`] normalizes the input in place and collects every
/// invalid field before failing.
#[derive(Debug, Clone, Default)]
pub struct Order {
    pub email: String,
    pub name: String,
    /// ISO 3166-1 alpha-2, uppercased during validation.
    pub country: String,
    pub address_line_1: String,
    pub address_line_2: String,
    pub postal_code: String,
    pub city: String,
    pub phone: String,
    pub tax_number: String,
    /// "monthly" or "yearly".
    pub interval: String,
    pub payment_method_id: String,
}

impl Order {
    /// Normalize and validate for a subscription: everything a new customer
    /// and subscription needs, including a parseable interval and a payment
    /// method.
    pub fn validate(&mut self) -> BillingResult<SubscriptionPlan> {
        let mut errors = self.validate_profile_fields();

        let plan = SubscriptionPlan::parse(&self.interval);
        if plan.is_none() {
            errors.push(FieldError::new("interval", "interval invalid"));
        }
        if self.payment_method_id.is_empty() {
            errors.push(FieldError::new("payment_method", "payment method required"));
        }

        match plan {
            Some(plan) if errors.is_empty() => {
                self.interval = plan.as_str().to_owned();
                Ok(plan)
            }
            _ => Err(BillingError::Validation(errors)),
        }
    }

    /// Normalize and validate for a customer profile update. The interval
    /// and payment method are not part of the profile and are ignored.
    pub fn validate_profile(&mut self) -> BillingResult<()> {
        let errors = self.validate_profile_fields();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(BillingError::Validation(errors))
        }
    }

    fn validate_profile_fields(&mut self) -> Vec<FieldError> {
        self.email = self.email.trim().to_owned();
        self.name = self.name.trim().to_owned();
        self.country = self.country.trim().to_uppercase();
        self.address_line_1 = self.address_line_1.trim().to_owned();
        self.address_line_2 = self.address_line_2.trim().to_owned();
        self.postal_code = self.postal_code.trim().to_owned();
        self.city = self.city.trim().to_owned();
        self.phone = self.phone.trim().to_owned();
        self.tax_number = self.tax_number.trim().to_owned();
        self.interval = self.interval.trim().to_lowercase();
        self.payment_method_id = self.payment_method_id.trim().to_owned();

        let mut errors = Vec::new();

        if self.email.is_empty() || !self.email.contains('@') {
            errors.push(FieldError::new("email", "email invalid"));
        }
        if self.name.is_empty() {
            errors.push(FieldError::new("name", "name required"));
        }
        if self.country.len() != 2 || !self.country.bytes().all(|b| b.is_ascii_uppercase()) {
            errors.push(FieldError::new("country", "country invalid"));
        }
        if self.address_line_1.is_empty() {
            errors.push(FieldError::new("address_line_1", "address required"));
        }
        if self.postal_code.is_empty() {
            errors.push(FieldError::new("postal_code", "postal code required"));
        }
        if self.city.is_empty() {
            errors.push(FieldError::new("city", "city required"));
        }

        errors
    }
}
