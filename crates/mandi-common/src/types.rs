//! Shared vocabulary types for the marketplace session protocol.

use rand::Rng;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Party roles within a session.
///
/// Authorization is by per-session role token, not by transport identity;
/// the role only says which token a party was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Vendor,
    Customer,
}

impl Role {
    /// Returns the display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Vendor => "vendor",
            Role::Customer => "customer",
        }
    }

    /// The other party in a session.
    pub fn counterparty(&self) -> Role {
        match self {
            Role::Vendor => Role::Customer,
            Role::Customer => Role::Vendor,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Supported working languages for messages and narratives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Hi,
    Ta,
}

impl Language {
    /// ISO 639-1 code.
    pub fn code(&self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Hi => "hi",
            Language::Ta => "ta",
        }
    }

    /// English display name.
    pub fn name(&self) -> &'static str {
        match self {
            Language::En => "English",
            Language::Hi => "Hindi",
            Language::Ta => "Tamil",
        }
    }

    /// Native display name.
    pub fn native_name(&self) -> &'static str {
        match self {
            Language::En => "English",
            Language::Hi => "हिन्दी",
            Language::Ta => "தமிழ்",
        }
    }

    /// All supported languages.
    pub fn all() -> &'static [Language] {
        &[Language::En, Language::Hi, Language::Ta]
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Product categories the marketplace serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductCategory {
    Vegetables,
    Fruits,
}

impl ProductCategory {
    /// Returns the lowercase category slug.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductCategory::Vegetables => "vegetables",
            ProductCategory::Fruits => "fruits",
        }
    }

    /// Parse a category slug (case-insensitive, trimmed).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "vegetables" => Some(ProductCategory::Vegetables),
            "fruits" => Some(ProductCategory::Fruits),
            _ => None,
        }
    }

    /// The static product list for this category. Prices come from the
    /// pricing oracle; the names are fixed.
    pub fn staple_products(&self) -> &'static [&'static str] {
        match self {
            ProductCategory::Vegetables => {
                &["Potato", "Tomato", "Cauliflower", "Onion", "Brinjal"]
            }
            ProductCategory::Fruits => &["Mango", "Banana", "Apple", "Papaya", "Grapes"],
        }
    }
}

impl std::fmt::Display for ProductCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Alphabet for session codes. Uppercase alphanumerics with the easily
/// misread characters (0/O, 1/I) removed so codes stay human-typeable.
const SESSION_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of a session code.
pub const SESSION_CODE_LEN: usize = 6;

/// Generate a short human-shareable session code.
///
/// Uniqueness is enforced by the session store, not here.
pub fn generate_session_code() -> String {
    let mut rng = rand::thread_rng();
    (0..SESSION_CODE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..SESSION_CODE_ALPHABET.len());
            SESSION_CODE_ALPHABET[idx] as char
        })
        .collect()
}

/// Round a price to the nearest whole rupee (midpoint rounds away from zero).
pub fn nearest_rupee(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_role_counterparty() {
        assert_eq!(Role::Vendor.counterparty(), Role::Customer);
        assert_eq!(Role::Customer.counterparty(), Role::Vendor);
    }

    #[test]
    fn test_language_codes() {
        assert_eq!(Language::En.code(), "en");
        assert_eq!(Language::Hi.code(), "hi");
        assert_eq!(Language::Ta.code(), "ta");
        assert_eq!(Language::all().len(), 3);
    }

    #[test]
    fn test_category_parse() {
        assert_eq!(
            ProductCategory::parse(" Vegetables "),
            Some(ProductCategory::Vegetables)
        );
        assert_eq!(ProductCategory::parse("FRUITS"), Some(ProductCategory::Fruits));
        assert_eq!(ProductCategory::parse("dairy"), None);
    }

    #[test]
    fn test_category_staples() {
        assert!(ProductCategory::Vegetables
            .staple_products()
            .contains(&"Tomato"));
        assert_eq!(ProductCategory::Fruits.staple_products().len(), 5);
    }

    #[test]
    fn test_session_code_shape() {
        let code = generate_session_code();
        assert_eq!(code.len(), SESSION_CODE_LEN);
        assert!(code
            .bytes()
            .all(|b| SESSION_CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_nearest_rupee() {
        assert_eq!(nearest_rupee(dec!(49.5)), dec!(50));
        assert_eq!(nearest_rupee(dec!(49.4)), dec!(49));
        assert_eq!(nearest_rupee(dec!(50)), dec!(50));
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Vendor).unwrap(), "\"vendor\"");
        assert_eq!(
            serde_json::to_string(&ProductCategory::Fruits).unwrap(),
            "\"fruits\""
        );
    }
}
