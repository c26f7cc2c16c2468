//! Per-(session, product) negotiation state machine.
//!
//! Each new customer offer is classified against the product's floor price
//! and market price:
//!
//! - at or above the floor: the vendor gets the final say
//!   (`PendingVendorApproval`); the machine never auto-accepts
//! - below the floor: the machine computes a suggested counter range and asks
//!   the narrative oracle for prose; after three below-floor rounds the
//!   negotiation is closed (`NegotiationLimitExceeded`)
//!
//! The machine computes every number itself; the oracle only ever supplies
//! words, and a failed oracle call falls back to a fixed template so the
//! price decision never stalls.
//!
//! Round counters are caller-supplied and validated: a round lower than the
//! last seen for a live record is a protocol error, and an equal round is
//! treated as a client retry and also rejected. Terminal records (accepted /
//! rejected / final offer) restart fresh at round 1 on the next offer;
//! a record that hit the round limit stays closed until explicitly reset.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mandi_common::nearest_rupee;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{MarketError, Result};
use crate::inventory::InventoryLedger;
use crate::oracle::{NarrativeOracle, NarrativeRequest};

/// Below-floor offers allowed before the negotiation closes.
pub const MAX_ROUNDS: u32 = 3;

/// Negotiation record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationStatus {
    Active,
    PendingVendorApproval,
    AiCounterOffer,
    NegotiationLimitExceeded,
    Accepted,
    Rejected,
    FinalOffer,
    CustomMessage,
}

impl NegotiationStatus {
    /// Terminal statuses permit no further price mutation without an
    /// explicit restart.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NegotiationStatus::Accepted
                | NegotiationStatus::Rejected
                | NegotiationStatus::FinalOffer
        )
    }
}

/// One offer in a record's history.
#[derive(Debug, Clone, Serialize)]
pub struct OfferEntry {
    pub round: u32,
    pub price: Decimal,
    pub at: DateTime<Utc>,
}

/// Live negotiation state for one product. One record per (session, product)
/// at a time; a new offer after a terminal status restarts the record.
#[derive(Debug, Clone, Serialize)]
pub struct NegotiationRecord {
    pub product_id: String,
    pub round: u32,
    pub offers: Vec<OfferEntry>,
    pub status: NegotiationStatus,
    pub final_price: Option<Decimal>,
}

impl NegotiationRecord {
    fn new(product_id: &str) -> Self {
        Self {
            product_id: product_id.to_string(),
            round: 0,
            offers: Vec::new(),
            status: NegotiationStatus::Active,
            final_price: None,
        }
    }
}

/// The vendor's reply to an offer awaiting approval.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VendorResponse {
    /// Accept the customer's offer; it becomes the agreed price.
    Accept,
    /// Turn the offer down. The customer may start over.
    Reject,
    /// Keep negotiating; the text is routed through the message relay.
    CustomMessage { text: String },
    /// Pin a take-it-or-leave-it price and close the record.
    FinalOffer { price: Decimal },
}

/// Synchronous classification of an offer, produced under the session lock
/// before any external call is awaited.
#[derive(Debug, Clone)]
pub enum OfferClassification {
    /// Offer cleared the floor; waiting on the vendor.
    VendorApproval {
        proposed_price: Decimal,
        floor_price: Decimal,
        market_price: Decimal,
        round: u32,
    },
    /// Offer is below the floor; a narrative is needed.
    BelowFloor {
        floor_price: Decimal,
        market_price: Decimal,
        round: u32,
        suggested_min: Decimal,
        suggested_max: Decimal,
        /// Round limit reached; the narrative must close the negotiation.
        limit_reached: bool,
    },
}

/// Outcome of a vendor response, for fan-out.
#[derive(Debug, Clone, Serialize)]
pub struct NegotiationResolution {
    pub product_id: String,
    pub status: NegotiationStatus,
    pub final_price: Option<Decimal>,
}

/// Suggested counter range `[avg-1, avg+1]` where `avg` is the floor/market
/// midpoint rounded to the nearest rupee. Computed here, never by the oracle.
pub fn counter_range(floor_price: Decimal, market_price: Decimal) -> (Decimal, Decimal) {
    let avg = nearest_rupee((floor_price + market_price) / dec!(2));
    (avg - Decimal::ONE, avg + Decimal::ONE)
}

/// All negotiation records for one session, keyed by product id.
/// Products negotiate independently.
#[derive(Debug, Default)]
pub struct NegotiationBook {
    records: HashMap<String, NegotiationRecord>,
}

impl NegotiationBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new customer offer and classify it. Mutates the record
    /// (round, offer history, transitional status) before returning, so the
    /// caller can await narrative generation without re-entering.
    pub fn begin_offer(
        &mut self,
        ledger: &InventoryLedger,
        product_id: &str,
        offer: Decimal,
        round: u32,
    ) -> Result<OfferClassification> {
        if offer <= Decimal::ZERO {
            return Err(MarketError::NonPositivePrice);
        }
        // Floor-price misconfiguration is fatal to the request, never defaulted.
        let floor_price = ledger.floor_price(product_id)?;
        let market_price = ledger.get(product_id)?.market_price;

        let record = self
            .records
            .entry(product_id.to_string())
            .or_insert_with(|| NegotiationRecord::new(product_id));

        match record.status {
            NegotiationStatus::NegotiationLimitExceeded => {
                return Err(MarketError::NegotiationClosed(
                    product_id.to_string(),
                    "round limit reached",
                ));
            }
            s if s.is_terminal() => {
                // Fresh record; the round counter context restarts at 1.
                debug!(product_id, prior = ?s, "Restarting negotiation record");
                *record = NegotiationRecord::new(product_id);
            }
            _ => {}
        }

        // Rounds must not go backwards within a record's lifetime. An equal
        // round is a client retry and is rejected rather than re-applied.
        if round <= record.round {
            return Err(MarketError::StaleRound {
                product_id: product_id.to_string(),
                round,
                last_round: record.round,
            });
        }

        record.round = round;
        record.offers.push(OfferEntry {
            round,
            price: offer,
            at: Utc::now(),
        });

        // Inclusive comparison: an offer exactly at the floor goes to the
        // vendor, never to a counter-offer.
        if offer >= floor_price {
            record.status = NegotiationStatus::PendingVendorApproval;
            info!(product_id, %offer, %floor_price, round, "Offer cleared floor, awaiting vendor");
            return Ok(OfferClassification::VendorApproval {
                proposed_price: offer,
                floor_price,
                market_price,
                round,
            });
        }

        let (suggested_min, suggested_max) = counter_range(floor_price, market_price);
        let limit_reached = round >= MAX_ROUNDS;
        record.status = if limit_reached {
            NegotiationStatus::NegotiationLimitExceeded
        } else {
            NegotiationStatus::AiCounterOffer
        };
        info!(
            product_id, %offer, %floor_price, round, limit_reached,
            "Offer below floor, countering"
        );

        Ok(OfferClassification::BelowFloor {
            floor_price,
            market_price,
            round,
            suggested_min,
            suggested_max,
            limit_reached,
        })
    }

    /// Apply the vendor's reply to an offer in `PendingVendorApproval`.
    pub fn respond(
        &mut self,
        product_id: &str,
        response: &VendorResponse,
    ) -> Result<NegotiationResolution> {
        let record = self
            .records
            .get_mut(product_id)
            .ok_or_else(|| MarketError::NothingToRespond(product_id.to_string()))?;

        if record.status != NegotiationStatus::PendingVendorApproval {
            return Err(MarketError::NothingToRespond(product_id.to_string()));
        }

        let offered = record
            .offers
            .last()
            .map(|o| o.price)
            .ok_or_else(|| MarketError::NothingToRespond(product_id.to_string()))?;

        let (status, final_price) = match response {
            VendorResponse::Accept => (NegotiationStatus::Accepted, Some(offered)),
            VendorResponse::Reject => (NegotiationStatus::Rejected, None),
            VendorResponse::CustomMessage { .. } => (NegotiationStatus::CustomMessage, None),
            VendorResponse::FinalOffer { price } => (NegotiationStatus::FinalOffer, Some(*price)),
        };

        record.status = status;
        record.final_price = final_price;
        info!(product_id, ?status, "Vendor responded to offer");

        Ok(NegotiationResolution {
            product_id: product_id.to_string(),
            status,
            final_price,
        })
    }

    /// Explicitly reopen a closed negotiation (vendor courtesy).
    pub fn reset(&mut self, product_id: &str) {
        self.records.remove(product_id);
    }

    /// Current record for a product, if any.
    pub fn record(&self, product_id: &str) -> Option<&NegotiationRecord> {
        self.records.get(product_id)
    }

    /// Drop all records (session teardown).
    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Fixed template used when narrative generation fails, carrying the same
/// round-limit semantics as the generated prose.
pub fn fallback_narrative(req: &NarrativeRequest) -> String {
    if req.closing {
        format!(
            "I appreciate your interest in my {}, but I truly cannot go below \
             a fair price between ₹{} and ₹{}. We have negotiated as far as I \
             can; this negotiation is now over. Thank you for visiting my stall.",
            req.product_name, req.suggested_min, req.suggested_max
        )
    } else {
        format!(
            "Thank you for your offer of ₹{} for my {}. Considering today's \
             market rate of ₹{}, could we settle between ₹{} and ₹{}? The \
             produce is fresh from this morning.",
            req.customer_offer,
            req.product_name,
            req.market_price,
            req.suggested_min,
            req.suggested_max
        )
    }
}

/// Narrative produced for a below-floor counter.
#[derive(Debug, Clone, Serialize)]
pub struct CounterNarrative {
    pub text: String,
    /// True when the fallback template was used instead of the oracle.
    pub from_fallback: bool,
}

/// Wraps the narrative oracle with the fallback path. The oracle client is
/// responsible for its own single retry/credential rotation; this layer just
/// guarantees prose always comes back.
pub struct Narrator {
    oracle: Arc<dyn NarrativeOracle>,
}

impl Narrator {
    pub fn new(oracle: Arc<dyn NarrativeOracle>) -> Self {
        Self { oracle }
    }

    /// Generate counter-offer prose, falling back to the fixed template on
    /// any oracle failure.
    pub async fn narrate(&self, req: &NarrativeRequest) -> CounterNarrative {
        match self.oracle.counter_narrative(req).await {
            Ok(text) => CounterNarrative {
                text,
                from_fallback: false,
            },
            Err(e) => {
                warn!(error = %e, product = %req.product_name, "Narrative generation failed, using template");
                CounterNarrative {
                    text: fallback_narrative(req),
                    from_fallback: true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::test_support::tomato;
    use crate::oracle::OracleError;
    use async_trait::async_trait;
    use mandi_common::Language;

    fn ledger() -> InventoryLedger {
        let mut ledger = InventoryLedger::new();
        ledger.replace(vec![tomato()]).unwrap();
        ledger
    }

    const TOMATO: &str = "vegetables-tomato";

    // Scenario A: floor 30, market 50, offer 35 at round 1 goes to the
    // vendor with the proposed price carried through.
    #[test]
    fn test_offer_above_floor_awaits_vendor() {
        let ledger = ledger();
        let mut book = NegotiationBook::new();

        let decision = book.begin_offer(&ledger, TOMATO, dec!(35), 1).unwrap();
        match decision {
            OfferClassification::VendorApproval {
                proposed_price,
                floor_price,
                market_price,
                round,
            } => {
                assert_eq!(proposed_price, dec!(35));
                assert_eq!(floor_price, dec!(30));
                assert_eq!(market_price, dec!(50));
                assert_eq!(round, 1);
            }
            other => panic!("expected VendorApproval, got {other:?}"),
        }
        assert_eq!(
            book.record(TOMATO).unwrap().status,
            NegotiationStatus::PendingVendorApproval
        );
    }

    // Floor-price inclusivity: an offer exactly at the floor goes to the
    // vendor, never to a counter-offer.
    #[test]
    fn test_offer_at_floor_is_inclusive() {
        let ledger = ledger();
        let mut book = NegotiationBook::new();
        let decision = book.begin_offer(&ledger, TOMATO, dec!(30), 1).unwrap();
        assert!(matches!(
            decision,
            OfferClassification::VendorApproval { .. }
        ));
    }

    // Scenario B: offer 20 against floor 30 / market 50 counters with the
    // range [39, 41].
    #[test]
    fn test_offer_below_floor_counters_with_range() {
        let ledger = ledger();
        let mut book = NegotiationBook::new();

        let decision = book.begin_offer(&ledger, TOMATO, dec!(20), 1).unwrap();
        match decision {
            OfferClassification::BelowFloor {
                suggested_min,
                suggested_max,
                limit_reached,
                ..
            } => {
                assert_eq!(suggested_min, dec!(39));
                assert_eq!(suggested_max, dec!(41));
                assert!(!limit_reached);
            }
            other => panic!("expected BelowFloor, got {other:?}"),
        }
        assert_eq!(
            book.record(TOMATO).unwrap().status,
            NegotiationStatus::AiCounterOffer
        );
    }

    // Counter-offer range correctness: floor 40, market 60 gives [49, 51].
    #[test]
    fn test_counter_range_midpoint() {
        let (min, max) = counter_range(dec!(40), dec!(60));
        assert_eq!(min, dec!(49));
        assert_eq!(max, dec!(51));
    }

    #[test]
    fn test_counter_range_rounds_midpoint_up() {
        // (30 + 45) / 2 = 37.5 -> 38
        let (min, max) = counter_range(dec!(30), dec!(45));
        assert_eq!(min, dec!(37));
        assert_eq!(max, dec!(39));
    }

    // Scenario C / round-limit termination: the third below-floor round
    // closes the negotiation and later offers are rejected until reset.
    #[test]
    fn test_round_limit_closes_negotiation() {
        let ledger = ledger();
        let mut book = NegotiationBook::new();

        for round in 1..=2 {
            let decision = book.begin_offer(&ledger, TOMATO, dec!(20), round).unwrap();
            assert!(matches!(
                decision,
                OfferClassification::BelowFloor {
                    limit_reached: false,
                    ..
                }
            ));
        }

        let decision = book.begin_offer(&ledger, TOMATO, dec!(20), 3).unwrap();
        assert!(matches!(
            decision,
            OfferClassification::BelowFloor {
                limit_reached: true,
                ..
            }
        ));
        assert_eq!(
            book.record(TOMATO).unwrap().status,
            NegotiationStatus::NegotiationLimitExceeded
        );

        // Closed: no further offers, even above the floor.
        assert!(matches!(
            book.begin_offer(&ledger, TOMATO, dec!(45), 4),
            Err(MarketError::NegotiationClosed(_, _))
        ));

        // Explicit reset reopens.
        book.reset(TOMATO);
        assert!(book.begin_offer(&ledger, TOMATO, dec!(45), 1).is_ok());
    }

    #[test]
    fn test_stale_round_is_protocol_error() {
        let ledger = ledger();
        let mut book = NegotiationBook::new();
        book.begin_offer(&ledger, TOMATO, dec!(20), 2).unwrap();

        // Going backwards is rejected...
        assert!(matches!(
            book.begin_offer(&ledger, TOMATO, dec!(22), 1),
            Err(MarketError::StaleRound { last_round: 2, .. })
        ));
        // ...and so is replaying the same round.
        assert!(matches!(
            book.begin_offer(&ledger, TOMATO, dec!(22), 2),
            Err(MarketError::StaleRound { .. })
        ));
        // The rejected offers were not recorded.
        assert_eq!(book.record(TOMATO).unwrap().offers.len(), 1);
    }

    #[test]
    fn test_missing_floor_price_is_fatal() {
        let mut ledger = InventoryLedger::new();
        let mut product = tomato();
        product.floor_price = None;
        ledger.replace(vec![product]).unwrap();

        let mut book = NegotiationBook::new();
        assert!(matches!(
            book.begin_offer(&ledger, TOMATO, dec!(35), 1),
            Err(MarketError::MissingFloorPrice(_))
        ));
        assert!(book.record(TOMATO).is_none());
    }

    #[test]
    fn test_vendor_accept_sets_final_price() {
        let ledger = ledger();
        let mut book = NegotiationBook::new();
        book.begin_offer(&ledger, TOMATO, dec!(35), 1).unwrap();

        let resolution = book.respond(TOMATO, &VendorResponse::Accept).unwrap();
        assert_eq!(resolution.status, NegotiationStatus::Accepted);
        assert_eq!(resolution.final_price, Some(dec!(35)));

        // Terminal: another response has nothing to act on.
        assert!(matches!(
            book.respond(TOMATO, &VendorResponse::Accept),
            Err(MarketError::NothingToRespond(_))
        ));
    }

    // Open-question decision: after a vendor reject the next offer restarts
    // the record at round 1.
    #[test]
    fn test_reject_restarts_round_counter() {
        let ledger = ledger();
        let mut book = NegotiationBook::new();
        book.begin_offer(&ledger, TOMATO, dec!(35), 1).unwrap();
        book.respond(TOMATO, &VendorResponse::Reject).unwrap();

        // Round 1 again is valid: a fresh record.
        let decision = book.begin_offer(&ledger, TOMATO, dec!(32), 1).unwrap();
        assert!(matches!(decision, OfferClassification::VendorApproval { .. }));
        let record = book.record(TOMATO).unwrap();
        assert_eq!(record.offers.len(), 1);
        assert_eq!(record.round, 1);
    }

    #[test]
    fn test_custom_message_keeps_negotiation_open() {
        let ledger = ledger();
        let mut book = NegotiationBook::new();
        book.begin_offer(&ledger, TOMATO, dec!(35), 1).unwrap();
        let resolution = book
            .respond(
                TOMATO,
                &VendorResponse::CustomMessage {
                    text: "Can you take 2kg at this price?".into(),
                },
            )
            .unwrap();
        assert_eq!(resolution.status, NegotiationStatus::CustomMessage);

        // Not terminal: the customer can offer again, round continuing.
        assert!(book.begin_offer(&ledger, TOMATO, dec!(36), 2).is_ok());
    }

    // Open-question decision: products negotiate independently.
    #[test]
    fn test_products_negotiate_independently() {
        let mut ledger = InventoryLedger::new();
        let mut onion = tomato();
        onion.id = "vegetables-onion".into();
        onion.name = "Onion".into();
        ledger.replace(vec![tomato(), onion]).unwrap();

        let mut book = NegotiationBook::new();
        for round in 1..=3 {
            book.begin_offer(&ledger, TOMATO, dec!(10), round).unwrap();
        }
        assert_eq!(
            book.record(TOMATO).unwrap().status,
            NegotiationStatus::NegotiationLimitExceeded
        );

        // The other product is unaffected.
        assert!(book
            .begin_offer(&ledger, "vegetables-onion", dec!(35), 1)
            .is_ok());
    }

    struct FailingOracle;

    #[async_trait]
    impl NarrativeOracle for FailingOracle {
        async fn counter_narrative(&self, _req: &NarrativeRequest) -> Result<String, OracleError> {
            Err(OracleError::Quota("exhausted".into()))
        }
    }

    #[tokio::test]
    async fn test_narrator_falls_back_on_failure() {
        let narrator = Narrator::new(Arc::new(FailingOracle));
        let req = NarrativeRequest {
            product_name: "Tomato".into(),
            customer_offer: dec!(20),
            floor_price: dec!(30),
            market_price: dec!(50),
            suggested_min: dec!(39),
            suggested_max: dec!(41),
            round: 3,
            closing: true,
            language: Language::En,
        };

        let narrative = narrator.narrate(&req).await;
        assert!(narrative.from_fallback);
        assert!(narrative.text.contains("negotiation is now over"));
        assert!(narrative.text.contains("₹39"));
        // The floor price never leaks into fallback prose.
        assert!(!narrative.text.contains("30"));
    }

    #[test]
    fn test_fallback_narrative_open_round() {
        let req = NarrativeRequest {
            product_name: "Tomato".into(),
            customer_offer: dec!(20),
            floor_price: dec!(30),
            market_price: dec!(50),
            suggested_min: dec!(39),
            suggested_max: dec!(41),
            round: 1,
            closing: false,
            language: Language::En,
        };
        let text = fallback_narrative(&req);
        assert!(text.contains("₹39"));
        assert!(text.contains("₹41"));
        assert!(!text.contains("over"));
    }
}
