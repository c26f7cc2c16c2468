//! External collaborator interfaces.
//!
//! The core never talks to an external provider directly; it consumes these
//! traits. Implementations live alongside (`gemini`, `payment`), tests supply
//! mocks. Every call site is expected to degrade gracefully: external
//! failures are retried at most once and then fall back, they never stall a
//! price decision or crash a session.

pub mod gemini;
pub mod payment;

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use mandi_common::{Language, ProductCategory, Role};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from external collaborators.
#[derive(Debug, Error)]
pub enum OracleError {
    /// Transport-level failure (timeout, connection refused).
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider returned an error status.
    #[error("provider error: status {status}, body: {body}")]
    Api { status: u16, body: String },

    /// Quota or rate limit exhausted for the current credential.
    #[error("quota exhausted: {0}")]
    Quota(String),

    /// Response arrived but could not be interpreted.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// No credential configured for this provider.
    #[error("provider not configured: {0}")]
    NotConfigured(&'static str),
}

impl OracleError {
    /// Whether a retry (possibly with a rotated credential) is worthwhile.
    /// Malformed payloads and missing configuration are not transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OracleError::Http(_) | OracleError::Api { .. } | OracleError::Quota(_)
        )
    }

    /// Whether the failure points at the credential rather than the request.
    pub fn is_quota(&self) -> bool {
        match self {
            OracleError::Quota(_) => true,
            OracleError::Api { status, .. } => *status == 429,
            _ => false,
        }
    }
}

/// Market price direction, as reported by the pricing oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PriceTrend {
    Up,
    Down,
    #[default]
    Stable,
}

/// A single market quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketQuote {
    pub price: Decimal,
    pub trend: PriceTrend,
}

/// One priced catalog entry for a category listing.
#[derive(Debug, Clone, Serialize)]
pub struct PricedProduct {
    pub id: String,
    pub name: String,
    pub category: ProductCategory,
    pub market_price: Decimal,
    pub trend: PriceTrend,
    pub location: String,
}

/// Live market-reference prices.
#[async_trait]
pub trait PricingOracle: Send + Sync {
    /// Current retail price per kg for one product at a location.
    async fn market_price(&self, product: &str, location: &str)
        -> Result<MarketQuote, OracleError>;

    /// Price the whole static catalog of a category in one call.
    async fn price_catalog(
        &self,
        category: ProductCategory,
        location: &str,
    ) -> Result<Vec<PricedProduct>, OracleError>;
}

/// Everything the narrative generator needs to produce counter-offer prose.
/// The suggested range is computed by the negotiation machine; the oracle
/// supplies words, never numbers.
#[derive(Debug, Clone)]
pub struct NarrativeRequest {
    pub product_name: String,
    pub customer_offer: Decimal,
    /// Present so the prompt can instruct the model what not to reveal;
    /// the prose must never contain it.
    pub floor_price: Decimal,
    pub market_price: Decimal,
    pub suggested_min: Decimal,
    pub suggested_max: Decimal,
    pub round: u32,
    /// True when the round limit was reached and the narrative must close
    /// the negotiation.
    pub closing: bool,
    pub language: Language,
}

/// Persuasive counter-offer prose.
#[async_trait]
pub trait NarrativeOracle: Send + Sync {
    async fn counter_narrative(&self, req: &NarrativeRequest) -> Result<String, OracleError>;
}

/// A message after tone/translation transformation.
#[derive(Debug, Clone, Serialize)]
pub struct TransformedText {
    pub rendered: String,
    pub sentiment: Option<String>,
}

/// Polite-indirect rewrite plus translation between working languages.
#[async_trait]
pub trait TransformOracle: Send + Sync {
    async fn transform(
        &self,
        text: &str,
        sender: Role,
        source: Language,
        target: Language,
    ) -> Result<TransformedText, OracleError>;

    /// Narrower variant for generated narratives: translate only, keeping
    /// the prose as written. The default rides the full transform.
    async fn translate(
        &self,
        text: &str,
        source: Language,
        target: Language,
    ) -> Result<String, OracleError> {
        Ok(self
            .transform(text, Role::Vendor, source, target)
            .await?
            .rendered)
    }
}

/// Handle to a created payment order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderHandle {
    pub order_id: String,
    /// Amount in rupees.
    pub amount: Decimal,
    pub reference: String,
}

/// Narrow payment-gateway contract: order creation and signature check.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(
        &self,
        amount: Decimal,
        reference: &str,
    ) -> Result<OrderHandle, OracleError>;

    async fn verify(
        &self,
        order: &OrderHandle,
        payment_id: &str,
        signature: &str,
    ) -> Result<bool, OracleError>;
}

/// A ring of interchangeable provider credentials. Rotated when the current
/// one hits a quota error, so one exhausted key does not take the feature
/// down. Generalizes the provider-specific key rotation of the upstream
/// service into a policy any oracle client can use.
#[derive(Debug)]
pub struct KeyRing {
    keys: Vec<String>,
    current: AtomicUsize,
}

impl KeyRing {
    /// Build a ring, dropping empty entries.
    pub fn new(keys: Vec<String>) -> Self {
        let keys: Vec<String> = keys.into_iter().filter(|k| !k.trim().is_empty()).collect();
        Self {
            keys,
            current: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The credential to use for the next call.
    pub fn current(&self) -> Result<&str, OracleError> {
        if self.keys.is_empty() {
            return Err(OracleError::NotConfigured("no API keys in ring"));
        }
        let idx = self.current.load(Ordering::Relaxed) % self.keys.len();
        Ok(&self.keys[idx])
    }

    /// Advance to the next credential. No-op with a single key.
    pub fn rotate(&self) {
        if self.keys.len() > 1 {
            let next = (self.current.load(Ordering::Relaxed) + 1) % self.keys.len();
            self.current.store(next, Ordering::Relaxed);
            debug!(key_index = next, "Rotated provider credential");
        }
    }

    /// Zero-based index of the current credential (for health reporting).
    pub fn current_index(&self) -> usize {
        if self.keys.is_empty() {
            0
        } else {
            self.current.load(Ordering::Relaxed) % self.keys.len()
        }
    }
}

/// Run an oracle call with the retry-with-fallback-credential policy:
/// one retry, rotating the ring first when the failure was quota-shaped.
/// Non-retryable errors pass straight through.
pub async fn call_with_retry<T, Fut, F>(ring: &KeyRing, op: F) -> Result<T, OracleError>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T, OracleError>>,
{
    let key = ring.current()?.to_string();
    match op(key).await {
        Ok(value) => Ok(value),
        Err(e) if e.is_retryable() => {
            if e.is_quota() {
                ring.rotate();
            }
            warn!(error = %e, "Oracle call failed, retrying once");
            let key = ring.current()?.to_string();
            op(key).await
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_keyring_drops_empty_keys() {
        let ring = KeyRing::new(vec!["".into(), "key-a".into(), "  ".into()]);
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.current().unwrap(), "key-a");
    }

    #[test]
    fn test_keyring_rotation_wraps() {
        let ring = KeyRing::new(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(ring.current().unwrap(), "a");
        ring.rotate();
        assert_eq!(ring.current().unwrap(), "b");
        ring.rotate();
        ring.rotate();
        assert_eq!(ring.current().unwrap(), "a");
    }

    #[test]
    fn test_empty_ring_is_not_configured() {
        let ring = KeyRing::new(vec![]);
        assert!(matches!(
            ring.current(),
            Err(OracleError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_rotates_on_quota() {
        let ring = KeyRing::new(vec!["a".into(), "b".into()]);
        let calls = AtomicU32::new(0);

        let result = call_with_retry(&ring, |key| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::Relaxed);
                if key == "a" {
                    Err(OracleError::Quota("rate limited".into()))
                } else {
                    Ok(key)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "b");
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_retry_does_not_touch_malformed() {
        let ring = KeyRing::new(vec!["a".into()]);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = call_with_retry(&ring, |_key| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::Relaxed);
                Err(OracleError::Malformed("bad json".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(OracleError::Malformed(_))));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_quota_detection() {
        assert!(OracleError::Quota("x".into()).is_quota());
        assert!(OracleError::Api {
            status: 429,
            body: String::new()
        }
        .is_quota());
        assert!(!OracleError::Api {
            status: 500,
            body: String::new()
        }
        .is_quota());
    }
}
