//! Stripe configuration loaded from the environment.

/// Configuration for the payment gateway.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Secret API key (`sk_test_...` / `sk_live_...`).
    pub secret_key: String,
    /// Price id for the monthly per-seat plan.
    pub monthly_price_id: String,
    /// Price id for the yearly per-seat plan.
    pub yearly_price_id: String,
    /// Tax rate id for domestic VAT, applied per the EU tax rules.
    pub domestic_tax_rate_id: String,
}

impl StripeConfig {
    /// Load from environment variables. Fails with the missing variable
    /// name so startup errors are actionable.
    pub fn from_env() -> Result<Self, String> {
        Ok(Self {
            secret_key: require("STRIPE_SECRET_KEY")?,
            monthly_price_id: require("STRIPE_MONTHLY_PRICE_ID")?,
            yearly_price_id: require("STRIPE_YEARLY_PRICE_ID")?,
            domestic_tax_rate_id: require("STRIPE_DOMESTIC_TAX_RATE_ID")?,
        })
    }

    /// Fixed configuration for tests.
    pub fn test() -> Self {
        Self {
            secret_key: "sk_test_quill".into(),
            monthly_price_id: "price_monthly_test".into(),
            yearly_price_id: "price_yearly_test".into(),
            domestic_tax_rate_id: "txr_de_test".into(),
        }
    }
}

fn require(name: &str) -> Result<String, String> {
    std::env::var(name).map_err(|_| format!("{} not set", name))
}
