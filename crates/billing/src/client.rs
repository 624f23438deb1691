//! Stripe-backed implementation of the payment gateway capability.
//!
//! Thin translation layer: every method maps one gateway operation to one
//! Stripe endpoint (plus the expand parameters it needs) and converts the
//! response into the gateway data types. No business rules live here.
//!
//! Customer balance transactions and tax id management are not covered by
//! async-stripe 0.39, so those endpoints are called directly over HTTP with
//! the same form encoding Stripe's SDKs use.

use async_trait::async_trait;
// The root re-export of `SubscriptionProrationBehavior` resolves to the
// subscription-item enum; `Subscription::update` takes the subscription one.
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use stripe::{
    AttachPaymentMethod, CancelSubscription, CreateCustomer, CreateSubscription,
    CreateSubscriptionItems, Customer, CustomerId, Invoice as StripeInvoice, InvoiceId,
    ListInvoices, PaymentIntent, PaymentIntentId, PaymentIntentStatus, PaymentMethod,
    PaymentMethodId, Subscription, SubscriptionId, SubscriptionPaymentBehavior, UpdateCustomer,
    UpdateSubscription, UpdateSubscriptionItems,
};
use time::OffsetDateTime;

use quill_shared::StripeConfig;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    BillingGateway, CardDetails, CreatedSubscription, CustomerDetails, CustomerProfile, Invoice,
    PaymentIntentDetails, PaymentMethodDetails, PaymentOutcome, SubscriptionDetails,
};
use crate::tax::TaxExemption;

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

/// Stripe API client plus the price and tax rate configuration.
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    http: reqwest::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            inner: stripe::Client::new(config.secret_key.clone()),
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Form-encoded POST against an endpoint async-stripe does not expose.
    async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> BillingResult<()> {
        let response = self
            .http
            .post(format!("{STRIPE_API_BASE}{path}"))
            .bearer_auth(&self.config.secret_key)
            .form(form)
            .send()
            .await
            .map_err(|e| BillingError::Gateway(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(path = %path, status = %status, body = %body, "Stripe API call failed");
            return Err(BillingError::Gateway(format!(
                "Stripe API error ({status}): {body}"
            )));
        }

        Ok(())
    }

    async fn get_json(&self, path: &str) -> BillingResult<serde_json::Value> {
        let response = self
            .http
            .get(format!("{STRIPE_API_BASE}{path}"))
            .bearer_auth(&self.config.secret_key)
            .send()
            .await
            .map_err(|e| BillingError::Gateway(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(path = %path, status = %status, body = %body, "Stripe API call failed");
            return Err(BillingError::Gateway(format!(
                "Stripe API error ({status}): {body}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| BillingError::Gateway(e.to_string()))
    }

    async fn delete(&self, path: &str) -> BillingResult<()> {
        let response = self
            .http
            .delete(format!("{STRIPE_API_BASE}{path}"))
            .bearer_auth(&self.config.secret_key)
            .send()
            .await
            .map_err(|e| BillingError::Gateway(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(path = %path, status = %status, body = %body, "Stripe API call failed");
            return Err(BillingError::Gateway(format!(
                "Stripe API error ({status}): {body}"
            )));
        }

        Ok(())
    }

    /// Replace the customer's tax ids with the one from the profile, or
    /// remove them all if none was supplied.
    async fn sync_tax_ids(&self, customer_id: &str, profile: &CustomerProfile) -> BillingResult<()> {
        let existing = self
            .get_json(&format!("/customers/{customer_id}/tax_ids"))
            .await?;

        let existing_values: Vec<(String, String)> = existing["data"]
            .as_array()
            .map(|data| {
                data.iter()
                    .filter_map(|t| {
                        Some((
                            t["id"].as_str()?.to_owned(),
                            t["value"].as_str().unwrap_or_default().to_owned(),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let wanted = profile.tax_id.as_ref();

        // Already in sync; the common case on profile updates.
        if let Some(tax_id) = wanted {
            if existing_values.len() == 1 && existing_values[0].1 == tax_id.value {
                return Ok(());
            }
        } else if existing_values.is_empty() {
            return Ok(());
        }

        for (id, _) in &existing_values {
            self.delete(&format!("/customers/{customer_id}/tax_ids/{id}"))
                .await?;
        }

        if let Some(tax_id) = wanted {
            self.post_form(
                &format!("/customers/{customer_id}/tax_ids"),
                &[
                    ("type", tax_id.id_type.as_stripe_type()),
                    ("value", &tax_id.value),
                ],
            )
            .await?;
        }

        Ok(())
    }
}

fn parse_customer_id(customer_id: &str) -> BillingResult<CustomerId> {
    customer_id
        .parse::<CustomerId>()
        .map_err(|e| BillingError::Gateway(format!("invalid customer id: {e}")))
}

fn parse_subscription_id(subscription_id: &str) -> BillingResult<SubscriptionId> {
    subscription_id
        .parse::<SubscriptionId>()
        .map_err(|e| BillingError::Gateway(format!("invalid subscription id: {e}")))
}

fn parse_payment_method_id(payment_method_id: &str) -> BillingResult<PaymentMethodId> {
    payment_method_id
        .parse::<PaymentMethodId>()
        .map_err(|e| BillingError::Gateway(format!("invalid payment method id: {e}")))
}

fn profile_address(profile: &CustomerProfile) -> stripe::Address {
    let mut address = stripe::Address::default();
    address.line1 = Some(profile.address_line_1.clone());
    if !profile.address_line_2.is_empty() {
        address.line2 = Some(profile.address_line_2.clone());
    }
    address.postal_code = Some(profile.postal_code.clone());
    address.city = Some(profile.city.clone());
    address.country = Some(profile.country.clone());
    address
}

fn tax_exempt_filter(exemption: TaxExemption) -> stripe::CustomerTaxExemptFilter {
    match exemption {
        TaxExemption::Reverse => stripe::CustomerTaxExemptFilter::Reverse,
        TaxExemption::None => stripe::CustomerTaxExemptFilter::None,
    }
}

fn subscription_details(subscription: &Subscription) -> BillingResult<SubscriptionDetails> {
    let item = subscription
        .items
        .data
        .first()
        .ok_or_else(|| BillingError::Gateway("subscription has no items".into()))?;

    let price = item.price.as_ref();

    Ok(SubscriptionDetails {
        id: subscription.id.to_string(),
        item_id: item.id.to_string(),
        price_id: price.map(|p| p.id.to_string()).unwrap_or_default(),
        quantity: item.quantity.unwrap_or(0),
        unit_amount: price.and_then(|p| p.unit_amount).unwrap_or(0),
        currency: price
            .and_then(|p| p.currency)
            .map(|c| c.to_string())
            .unwrap_or_default(),
        cancel_at_period_end: subscription.cancel_at_period_end,
        tax_rate_ids: item
            .tax_rates
            .as_ref()
            .map(|rates| rates.iter().map(|r| r.id.to_string()).collect())
            .unwrap_or_default(),
    })
}

/// Outcome of the first charge on a freshly created subscription, read from
/// the expanded latest invoice.
fn charge_outcome(subscription: &Subscription) -> PaymentOutcome {
    let intent = subscription
        .latest_invoice
        .as_ref()
        .and_then(|invoice| match invoice {
            stripe::Expandable::Object(invoice) => invoice.payment_intent.as_ref(),
            stripe::Expandable::Id(_) => None,
        })
        .and_then(|intent| match intent {
            stripe::Expandable::Object(intent) => Some(intent),
            stripe::Expandable::Id(_) => None,
        });

    match intent {
        Some(intent) if intent.status == PaymentIntentStatus::RequiresAction => {
            match intent.client_secret.clone() {
                Some(client_secret) => PaymentOutcome::RequiresAction { client_secret },
                None => PaymentOutcome::Paid,
            }
        }
        _ => PaymentOutcome::Paid,
    }
}

#[async_trait]
impl BillingGateway for StripeClient {
    async fn create_customer(&self, profile: &CustomerProfile) -> BillingResult<String> {
        let mut params = CreateCustomer::new();
        params.email = Some(&profile.email);
        params.name = Some(&profile.name);
        if !profile.phone.is_empty() {
            params.phone = Some(&profile.phone);
        }
        params.address = Some(profile_address(profile));
        params.tax_exempt = Some(tax_exempt_filter(profile.tax_exempt));

        let customer = Customer::create(self.inner(), params).await?;

        if profile.tax_id.is_some() {
            self.sync_tax_ids(customer.id.as_str(), profile).await?;
        }

        tracing::debug!(customer_id = %customer.id, "created customer");
        Ok(customer.id.to_string())
    }

    async fn get_customer(&self, customer_id: &str) -> BillingResult<CustomerDetails> {
        let id = parse_customer_id(customer_id)?;
        let customer = Customer::retrieve(self.inner(), &id, &["tax_ids"]).await?;

        let address = customer.address.as_ref();

        Ok(CustomerDetails {
            id: customer.id.to_string(),
            email: customer.email.clone().unwrap_or_default(),
            name: customer.name.clone().unwrap_or_default(),
            country: address
                .and_then(|a| a.country.clone())
                .unwrap_or_default(),
            address_line_1: address.and_then(|a| a.line1.clone()).unwrap_or_default(),
            address_line_2: address.and_then(|a| a.line2.clone()).unwrap_or_default(),
            postal_code: address
                .and_then(|a| a.postal_code.clone())
                .unwrap_or_default(),
            city: address.and_then(|a| a.city.clone()).unwrap_or_default(),
            phone: customer.phone.clone().unwrap_or_default(),
            tax_number: customer
                .tax_ids
                .as_ref()
                .and_then(|ids| ids.data.first())
                .and_then(|tax_id| tax_id.value.clone())
                .unwrap_or_default(),
            balance: customer.balance.unwrap_or(0),
        })
    }

    async fn update_customer(
        &self,
        customer_id: &str,
        profile: &CustomerProfile,
    ) -> BillingResult<()> {
        let id = parse_customer_id(customer_id)?;

        let mut params = UpdateCustomer::new();
        params.email = Some(&profile.email);
        params.name = Some(&profile.name);
        if !profile.phone.is_empty() {
            params.phone = Some(&profile.phone);
        }
        params.address = Some(profile_address(profile));
        params.tax_exempt = Some(tax_exempt_filter(profile.tax_exempt));

        Customer::update(self.inner(), &id, params).await?;
        self.sync_tax_ids(customer_id, profile).await?;

        Ok(())
    }

    async fn delete_customer(&self, customer_id: &str) -> BillingResult<()> {
        let id = parse_customer_id(customer_id)?;
        Customer::delete(self.inner(), &id).await?;
        tracing::debug!(customer_id = %customer_id, "deleted customer");
        Ok(())
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        quantity: u64,
        tax_rate_id: Option<&str>,
    ) -> BillingResult<CreatedSubscription> {
        let id = parse_customer_id(customer_id)?;

        let mut params = CreateSubscription::new(id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price_id.to_string()),
            quantity: Some(quantity),
            tax_rates: tax_rate_id.map(|rate| vec![rate.to_string()]),
            ..Default::default()
        }]);
        // Let the subscription come up even when the first charge needs
        // authentication; the outcome is reported to the caller instead.
        params.payment_behavior = Some(SubscriptionPaymentBehavior::AllowIncomplete);
        params.expand = &["latest_invoice.payment_intent"];

        let subscription = Subscription::create(self.inner(), params).await?;
        let outcome = charge_outcome(&subscription);

        tracing::debug!(
            customer_id = %customer_id,
            subscription_id = %subscription.id,
            requires_action = matches!(outcome, PaymentOutcome::RequiresAction { .. }),
            "created subscription"
        );

        Ok(CreatedSubscription {
            id: subscription.id.to_string(),
            outcome,
        })
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionDetails> {
        let id = parse_subscription_id(subscription_id)?;
        let subscription = Subscription::retrieve(self.inner(), &id, &[]).await?;
        subscription_details(&subscription)
    }

    async fn update_subscription_quantity(
        &self,
        subscription_id: &str,
        item_id: &str,
        quantity: u64,
    ) -> BillingResult<()> {
        let id = parse_subscription_id(subscription_id)?;

        let mut params = UpdateSubscription::new();
        params.items = Some(vec![UpdateSubscriptionItems {
            id: Some(item_id.to_string()),
            quantity: Some(quantity),
            ..Default::default()
        }]);
        // Seat changes are settled by the balance reconciliation job, not
        // by gateway prorations.
        params.proration_behavior = Some(SubscriptionProrationBehavior::None);

        Subscription::update(self.inner(), &id, params).await?;
        Ok(())
    }

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        item_id: &str,
        price_id: &str,
    ) -> BillingResult<()> {
        let id = parse_subscription_id(subscription_id)?;

        let mut params = UpdateSubscription::new();
        params.items = Some(vec![UpdateSubscriptionItems {
            id: Some(item_id.to_string()),
            price: Some(price_id.to_string()),
            ..Default::default()
        }]);
        params.proration_behavior = Some(SubscriptionProrationBehavior::CreateProrations);

        Subscription::update(self.inner(), &id, params).await?;
        Ok(())
    }

    async fn update_subscription_tax_rate(
        &self,
        subscription_id: &str,
        item_id: &str,
        tax_rate_id: Option<&str>,
    ) -> BillingResult<()> {
        let id = parse_subscription_id(subscription_id)?;

        let mut params = UpdateSubscription::new();
        params.items = Some(vec![UpdateSubscriptionItems {
            id: Some(item_id.to_string()),
            // An empty list clears the rates on the item.
            tax_rates: Some(
                tax_rate_id
                    .map(|rate| vec![rate.to_string()])
                    .unwrap_or_default(),
            ),
            ..Default::default()
        }]);
        params.proration_behavior = Some(SubscriptionProrationBehavior::None);

        Subscription::update(self.inner(), &id, params).await?;
        Ok(())
    }

    async fn set_subscription_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<()> {
        let id = parse_subscription_id(subscription_id)?;

        let mut params = UpdateSubscription::new();
        params.cancel_at_period_end = Some(cancel);

        Subscription::update(self.inner(), &id, params).await?;
        Ok(())
    }

    async fn cancel_subscription_now(&self, subscription_id: &str) -> BillingResult<()> {
        let id = parse_subscription_id(subscription_id)?;
        Subscription::cancel(self.inner(), &id, CancelSubscription::default()).await?;
        tracing::debug!(subscription_id = %subscription_id, "cancelled subscription");
        Ok(())
    }

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
    ) -> BillingResult<()> {
        let pm_id = parse_payment_method_id(payment_method_id)?;
        let customer = parse_customer_id(customer_id)?;

        PaymentMethod::attach(self.inner(), &pm_id, AttachPaymentMethod { customer }).await?;
        Ok(())
    }

    async fn detach_payment_method(&self, payment_method_id: &str) -> BillingResult<()> {
        let pm_id = parse_payment_method_id(payment_method_id)?;
        PaymentMethod::detach(self.inner(), &pm_id).await?;
        Ok(())
    }

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        let id = parse_customer_id(customer_id)?;

        let mut params = UpdateCustomer::new();
        params.invoice_settings = Some(stripe::CustomerInvoiceSettings {
            default_payment_method: Some(payment_method_id.to_string()),
            ..Default::default()
        });

        Customer::update(self.inner(), &id, params).await?;
        Ok(())
    }

    async fn get_payment_method(
        &self,
        payment_method_id: &str,
    ) -> BillingResult<PaymentMethodDetails> {
        let pm_id = parse_payment_method_id(payment_method_id)?;
        let pm = PaymentMethod::retrieve(self.inner(), &pm_id, &[]).await?;

        Ok(PaymentMethodDetails {
            id: pm.id.to_string(),
            card: pm.card.as_ref().map(|card| CardDetails {
                brand: card.brand.clone(),
                last4: card.last4.clone(),
                exp_month: card.exp_month,
                exp_year: card.exp_year,
            }),
        })
    }

    async fn get_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<PaymentIntentDetails> {
        let id = payment_intent_id
            .parse::<PaymentIntentId>()
            .map_err(|e| BillingError::Gateway(format!("invalid payment intent id: {e}")))?;
        let intent = PaymentIntent::retrieve(self.inner(), &id, &[]).await?;

        Ok(PaymentIntentDetails {
            id: intent.id.to_string(),
            client_secret: intent.client_secret.clone(),
        })
    }

    async fn list_invoices(
        &self,
        subscription_id: &str,
        starting_after: Option<&str>,
        limit: u64,
    ) -> BillingResult<Vec<Invoice>> {
        let id = parse_subscription_id(subscription_id)?;

        let mut params = ListInvoices::new();
        params.subscription = Some(id);
        params.limit = Some(limit);
        if let Some(after) = starting_after {
            let invoice_id = after
                .parse::<InvoiceId>()
                .map_err(|e| BillingError::Gateway(format!("invalid invoice id: {e}")))?;
            params.starting_after = Some(invoice_id);
        }

        let response = StripeInvoice::list(self.inner(), &params).await?;

        Ok(response
            .data
            .into_iter()
            .map(|invoice| Invoice {
                id: invoice.id.to_string(),
                number: invoice.number.clone(),
                total: invoice.total.unwrap_or(0),
                currency: invoice
                    .currency
                    .map(|c| c.to_string())
                    .unwrap_or_default(),
                created: invoice
                    .created
                    .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
                    .unwrap_or(OffsetDateTime::UNIX_EPOCH),
                invoice_pdf: invoice.invoice_pdf.clone(),
                status: invoice.status.map(|s| s.to_string()),
            })
            .collect())
    }

    async fn add_balance(
        &self,
        customer_id: &str,
        amount: i64,
        currency: &str,
        description: &str,
    ) -> BillingResult<()> {
        let amount_str = amount.to_string();
        self.post_form(
            &format!("/customers/{customer_id}/balance_transactions"),
            &[
                ("amount", amount_str.as_str()),
                ("currency", currency),
                ("description", description),
            ],
        )
        .await?;

        tracing::debug!(customer_id = %customer_id, amount = amount, "applied balance transaction");
        Ok(())
    }
}
