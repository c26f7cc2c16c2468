//! Gemini-backed oracle implementations.
//!
//! One REST client serves all three language-model roles: market pricing,
//! counter-offer narratives, and message tone/translation transforms. Every
//! call runs through the credential ring with the single-retry policy, and
//! every numeric output is validated and clamped before it reaches the core.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mandi_common::{Language, ProductCategory, Role};
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{
    call_with_retry, KeyRing, MarketQuote, NarrativeOracle, NarrativeRequest, OracleError,
    PriceTrend, PricedProduct, PricingOracle, TransformOracle, TransformedText,
};

/// Default Gemini API base URL.
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Default model for all three roles.
const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Request timeout for generation calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Sanity bounds for model-reported prices, in rupees per kg. Anything
/// outside is clamped rather than trusted.
const MIN_PRICE: Decimal = dec!(10);
const MAX_PRICE: Decimal = dec!(500);

/// Gemini REST client.
pub struct GeminiClient {
    http: Client,
    keys: Arc<KeyRing>,
    base_url: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

/// Model output for a single price lookup.
#[derive(Debug, Deserialize)]
struct QuotePayload {
    price: Decimal,
    #[serde(default)]
    trend: PriceTrend,
}

/// Model output for one catalog entry.
#[derive(Debug, Deserialize)]
struct CatalogEntry {
    name: String,
    price: Decimal,
    #[serde(default)]
    trend: PriceTrend,
}

/// Model output for a message transform.
#[derive(Debug, Deserialize)]
struct TransformPayload {
    message: String,
    #[serde(default)]
    sentiment: Option<String>,
}

impl GeminiClient {
    pub fn new(keys: Arc<KeyRing>, base_url: Option<String>, model: Option<String>) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http,
            keys,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }
    }

    /// Credential ring, exposed for health reporting.
    pub fn keys(&self) -> &KeyRing {
        &self.keys
    }

    /// One generateContent call with a specific key.
    async fn generate(&self, key: &str, prompt: &str) -> Result<String, OracleError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, key
        );
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });

        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Gemini API error");
            if status.as_u16() == 429 || body.contains("RESOURCE_EXHAUSTED") {
                return Err(OracleError::Quota(body));
            }
            return Err(OracleError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let response: GenerateResponse = response.json().await?;
        let text = response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| OracleError::Malformed("empty candidate list".to_string()))?;

        Ok(text)
    }

    /// Generate through the credential ring with the retry policy.
    async fn generate_with_retry(&self, prompt: &str) -> Result<String, OracleError> {
        call_with_retry(&self.keys, |key| {
            let prompt = prompt.to_string();
            async move { self.generate(&key, &prompt).await }
        })
        .await
    }
}

/// Strip a markdown code fence the model may wrap JSON in.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

/// Clamp a model-reported price into the sanity band.
fn clamp_price(price: Decimal) -> Decimal {
    price.max(MIN_PRICE).min(MAX_PRICE)
}

#[async_trait]
impl PricingOracle for GeminiClient {
    async fn market_price(
        &self,
        product: &str,
        location: &str,
    ) -> Result<MarketQuote, OracleError> {
        let prompt = format!(
            "What is the current retail market price of {product} in {location}, India, \
             in rupees per kg? Respond with ONLY a JSON object, no prose: \
             {{\"price\": <number>, \"trend\": \"up\"|\"down\"|\"stable\"}}"
        );
        let text = self.generate_with_retry(&prompt).await?;
        let payload: QuotePayload = serde_json::from_str(strip_code_fence(&text))
            .map_err(|e| OracleError::Malformed(format!("price payload: {e}")))?;

        debug!(product, price = %payload.price, "Market price fetched");
        Ok(MarketQuote {
            price: clamp_price(payload.price),
            trend: payload.trend,
        })
    }

    async fn price_catalog(
        &self,
        category: ProductCategory,
        location: &str,
    ) -> Result<Vec<PricedProduct>, OracleError> {
        let names = category.staple_products().join(", ");
        let prompt = format!(
            "Current retail market prices in {location}, India, in rupees per kg, for \
             these {category}: {names}. Respond with ONLY a JSON array, no prose, one \
             entry per product, in the same order: \
             [{{\"name\": <string>, \"price\": <number>, \"trend\": \"up\"|\"down\"|\"stable\"}}]"
        );
        let text = self.generate_with_retry(&prompt).await?;
        let entries: Vec<CatalogEntry> = serde_json::from_str(strip_code_fence(&text))
            .map_err(|e| OracleError::Malformed(format!("catalog payload: {e}")))?;

        Ok(entries
            .into_iter()
            .map(|e| PricedProduct {
                id: format!("{}-{}", category, e.name.to_lowercase()),
                name: e.name,
                category,
                market_price: clamp_price(e.price),
                trend: e.trend,
                location: location.to_string(),
            })
            .collect())
    }
}

#[async_trait]
impl NarrativeOracle for GeminiClient {
    async fn counter_narrative(&self, req: &NarrativeRequest) -> Result<String, OracleError> {
        let closing_clause = if req.closing {
            "This was the final round: politely but firmly state that the negotiation \
             is over and no further offers will be considered."
        } else {
            "Invite a better offer."
        };
        let prompt = format!(
            "You are a friendly street vendor in an Indian mandi selling {product}. \
             The customer offered ₹{offer}/kg (round {round}). Today's market price is \
             ₹{market}/kg. Counter by suggesting a price between ₹{min} and ₹{max} per kg. \
             {closing_clause} Write 2-3 warm, persuasive sentences in {language}. \
             Mention freshness or quality. NEVER mention your minimum acceptable price \
             or the words 'floor' or 'minimum price'. Respond with the message text only.",
            product = req.product_name,
            offer = req.customer_offer,
            round = req.round,
            market = req.market_price,
            min = req.suggested_min,
            max = req.suggested_max,
            language = req.language.name(),
        );
        let text = self.generate_with_retry(&prompt).await?;
        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl TransformOracle for GeminiClient {
    async fn transform(
        &self,
        text: &str,
        sender: Role,
        source: Language,
        target: Language,
    ) -> Result<TransformedText, OracleError> {
        let translation_clause = if source == target {
            format!("Keep the message in {}.", source.name())
        } else {
            format!("Translate from {} to {}.", source.name(), target.name())
        };
        let prompt = format!(
            "Rewrite this marketplace chat message from the {sender} so it is polite \
             and indirect, preserving the meaning and any numbers exactly. \
             {translation_clause} Respond with ONLY a JSON object, no prose: \
             {{\"message\": <string>, \"sentiment\": \"positive\"|\"neutral\"|\"negative\"}}\n\
             Message: {text}"
        );
        let raw = self.generate_with_retry(&prompt).await?;

        // Tolerate a model that answered in plain text.
        match serde_json::from_str::<TransformPayload>(strip_code_fence(&raw)) {
            Ok(payload) => Ok(TransformedText {
                rendered: payload.message,
                sentiment: payload.sentiment,
            }),
            Err(_) => Ok(TransformedText {
                rendered: raw.trim().to_string(),
                sentiment: None,
            }),
        }
    }

    async fn translate(
        &self,
        text: &str,
        source: Language,
        target: Language,
    ) -> Result<String, OracleError> {
        if source == target {
            return Ok(text.to_string());
        }
        let prompt = format!(
            "Translate this marketplace message from {} to {}, preserving the \
             meaning, tone and any numbers exactly. Respond with ONLY the \
             translated text, no quotes, no prose.\nMessage: {text}",
            source.name(),
            target.name()
        );
        let raw = self.generate_with_retry(&prompt).await?;
        Ok(raw.trim().to_string())
    }
}
