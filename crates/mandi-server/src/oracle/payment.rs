//! Razorpay payment gateway client.
//!
//! Order creation goes through the REST API with basic auth; payment
//! verification is a local HMAC-SHA256 check over `order_id|payment_id`
//! against the gateway's signature, so a confirmation never trusts the
//! client's word for it.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::{info, warn};

use super::{OracleError, OrderHandle, PaymentGateway};

/// Default Razorpay API base URL.
const DEFAULT_BASE_URL: &str = "https://api.razorpay.com/v1";

/// Request timeout for gateway calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

type HmacSha256 = Hmac<Sha256>;

/// Razorpay REST client.
pub struct RazorpayClient {
    http: Client,
    key_id: String,
    key_secret: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    /// Amount in paise.
    amount: i64,
    receipt: String,
}

impl RazorpayClient {
    pub fn new(key_id: String, key_secret: String, base_url: Option<String>) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http,
            key_id,
            key_secret,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    /// Whether both credentials are present.
    pub fn is_configured(&self) -> bool {
        !self.key_id.is_empty() && !self.key_secret.is_empty()
    }
}

/// Convert a rupee amount to whole paise (midpoint rounds away from zero).
fn to_paise(amount: Decimal) -> Result<i64, OracleError> {
    mandi_common::nearest_rupee(amount * dec!(100))
        .to_i64()
        .ok_or_else(|| OracleError::Malformed(format!("amount out of range: {amount}")))
}

/// Compute the expected signature for an order/payment pair.
fn expected_signature(key_secret: &str, order_id: &str, payment_id: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key_secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(format!("{order_id}|{payment_id}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[async_trait]
impl PaymentGateway for RazorpayClient {
    async fn create_order(
        &self,
        amount: Decimal,
        reference: &str,
    ) -> Result<OrderHandle, OracleError> {
        if !self.is_configured() {
            return Err(OracleError::NotConfigured("razorpay credentials"));
        }
        let body = json!({
            "amount": to_paise(amount)?,
            "currency": "INR",
            "receipt": reference,
        });

        let response = self
            .http
            .post(format!("{}/orders", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&body)
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Razorpay order creation failed");
            return Err(OracleError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let order: OrderResponse = response.json().await?;
        info!(order_id = %order.id, amount_paise = order.amount, "Gateway order created");
        Ok(OrderHandle {
            order_id: order.id,
            amount,
            reference: order.receipt,
        })
    }

    async fn verify(
        &self,
        order: &OrderHandle,
        payment_id: &str,
        signature: &str,
    ) -> Result<bool, OracleError> {
        if !self.is_configured() {
            return Err(OracleError::NotConfigured("razorpay credentials"));
        }
        let expected = expected_signature(&self.key_secret, &order.order_id, payment_id);
        Ok(expected == signature)
    }
}
