//! EU VAT rules for subscription billing.
//!
//! Pure functions of the ISO 3166-1 alpha-2 country code and the supplied
//! tax registration number. Germany is the home country: domestic VAT
//! always applies there. For other EU countries VAT applies only when no
//! tax number was supplied (private consumer inference); with a tax number
//! the B2B reverse-charge procedure applies instead. Outside the EU no VAT
//! is charged.

/// EU member states, ISO 3166-1 alpha-2.
const EU_COUNTRIES: [&str; 27] = [
    "BE", "BG", "DK", "DE", "EE", "FI", "FR", "GR", "IE", "IT", "HR", "LV", "LT", "LU", "MT",
    "NL", "AT", "PL", "PT", "RO", "SK", "SI", "ES", "SE", "CZ", "HU", "CY",
];

const HOME_COUNTRY: &str = "DE";

/// Tax id type reported to the gateway for a customer's tax number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaxIdType {
    EuVat,
    Unknown,
}

impl TaxIdType {
    pub fn as_stripe_type(&self) -> &'static str {
        match self {
            TaxIdType::EuVat => "eu_vat",
            TaxIdType::Unknown => "unknown",
        }
    }
}

/// Customer tax exemption status on the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaxExemption {
    /// B2B reverse charge (EU outside the home country).
    Reverse,
    None,
}

pub fn is_eu_country(country: &str) -> bool {
    EU_COUNTRIES.contains(&country)
}

/// The tax rate to apply to a subscription, if any.
///
/// Returns the domestic rate for the home country (always) and for EU
/// countries without a tax number; `None` otherwise (reverse charge or
/// out of union).
pub fn tax_rate_id<'a>(
    country: &str,
    tax_number: &str,
    domestic_rate_id: &'a str,
) -> Option<&'a str> {
    if country == HOME_COUNTRY || (tax_number.is_empty() && is_eu_country(country)) {
        return Some(domestic_rate_id);
    }

    None
}

/// Tax id type for a country; EU VAT inside the union, unknown elsewhere.
pub fn tax_id_type(country: &str) -> TaxIdType {
    if is_eu_country(country) {
        TaxIdType::EuVat
    } else {
        TaxIdType::Unknown
    }
}

/// Exemption status: reverse charge for EU countries other than the home
/// country, none for the home country and the rest of the world.
pub fn tax_exemption(country: &str) -> TaxExemption {
    if is_eu_country(country) && country != HOME_COUNTRY {
        TaxExemption::Reverse
    } else {
        TaxExemption::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: &str = "txr_de";

    #[test]
    fn domestic_rate_applies_at_home_with_and_without_tax_number() {
        assert_eq!(tax_rate_id("DE", "", RATE), Some(RATE));
        assert_eq!(tax_rate_id("DE", "DE123456789", RATE), Some(RATE));
    }

    #[test]
    fn eu_private_consumers_pay_domestic_rate() {
        assert_eq!(tax_rate_id("FR", "", RATE), Some(RATE));
        assert_eq!(tax_rate_id("AT", "", RATE), Some(RATE));
    }

    #[test]
    fn eu_businesses_reverse_charge() {
        assert_eq!(tax_rate_id("FR", "FR123456789", RATE), None);
        assert_eq!(tax_exemption("FR"), TaxExemption::Reverse);
    }

    #[test]
    fn outside_eu_no_tax() {
        assert_eq!(tax_rate_id("JP", "", RATE), None);
        assert_eq!(tax_rate_id("US", "US123", RATE), None);
        assert_eq!(tax_exemption("JP"), TaxExemption::None);
    }

    #[test]
    fn home_country_is_never_reverse_charged() {
        assert_eq!(tax_exemption("DE"), TaxExemption::None);
    }

    #[test]
    fn tax_id_type_follows_eu_membership() {
        assert_eq!(tax_id_type("SE"), TaxIdType::EuVat);
        assert_eq!(tax_id_type("GB"), TaxIdType::Unknown);
        assert_eq!(tax_id_type(""), TaxIdType::Unknown);
    }
}
