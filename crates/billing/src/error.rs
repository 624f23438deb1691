//! Billing error taxonomy.

pub type BillingResult<T> = Result<T, BillingError>;

/// A single invalid field in a billing profile submission.
///
/// Validation collects every problem before failing so the caller can show
/// all of them at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: &'static str,
}

impl FieldError {
    pub fn new(field: &'static str, message: &'static str) -> Self {
        Self { field, message }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("invalid billing profile")]
    Validation(Vec<FieldError>),

    #[error("subscription not found")]
    SubscriptionNotFound,

    #[error("subscription is cancelled already")]
    SubscriptionAlreadyCancelled,

    #[error("subscription is not cancelled")]
    SubscriptionNotCancelled,

    #[error("organization has an active subscription")]
    ActiveSubscriptionExists,

    #[error("customer not found")]
    CustomerNotFound,

    #[error("payment method not found")]
    PaymentMethodNotFound,

    #[error("payment intent not found")]
    PaymentIntentNotFound,

    #[error("error processing payment")]
    ProcessingPayment,

    /// Raw gateway failures. The detail goes to the log, never to the
    /// caller-visible message.
    #[error("payment gateway operation failed")]
    Gateway(String),

    #[error("error saving organization")]
    Saving,

    #[error("organization not found")]
    OrganizationNotFound,

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::Gateway(e.to_string())
    }
}

impl From<quill_shared::StoreError> for BillingError {
    fn from(e: quill_shared::StoreError) -> Self {
        match e {
            quill_shared::StoreError::NotFound => BillingError::OrganizationNotFound,
            quill_shared::StoreError::Database(_) => BillingError::Saving,
        }
    }
}

/// Shorthand for a single-field validation failure.
pub fn invalid(field: &'static str, message: &'static str) -> BillingError {
    BillingError::Validation(vec![FieldError::new(field, message)])
}
