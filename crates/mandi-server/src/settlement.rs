//! Settlement coordination.
//!
//! Settlement happens in two phases: one side initiates (producing a pending
//! record with a server-generated reference), the counterparty confirms or
//! rejects. Confirmation is the only place stock is deducted, and every
//! reference lands in a settled set exactly once, so replayed confirmations
//! are rejected instead of double-deducting.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cart::Cart;
use crate::error::{MarketError, Result};
use crate::inventory::InventoryLedger;
use crate::oracle::OrderHandle;

/// How the sale is being paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementMethod {
    /// Hand-to-hand payment, confirmed by the counterparty in the app.
    Cash,
    /// Online payment through the gateway, confirmed by signature.
    Gateway,
}

/// A settlement awaiting confirmation.
#[derive(Debug, Clone, Serialize)]
pub struct PendingSettlement {
    /// Server-generated reference, unique per attempt.
    pub reference: String,
    pub method: SettlementMethod,
    /// Cart total snapshotted at initiation, for display. The completed-sale
    /// totals are recomputed from the cart at confirmation time.
    pub amount: Decimal,
    /// Gateway order, present only for gateway settlements.
    pub order: Option<OrderHandle>,
    pub initiated_at: DateTime<Utc>,
}

/// One sold line in a completed sale.
#[derive(Debug, Clone, Serialize)]
pub struct SoldLine {
    pub product_id: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub total: Decimal,
}

/// Broadcast payload for a finished sale.
#[derive(Debug, Clone, Serialize)]
pub struct SaleCompleted {
    pub reference: String,
    pub method: SettlementMethod,
    pub lines: Vec<SoldLine>,
    pub total: Decimal,
    pub settled_at: DateTime<Utc>,
}

/// Per-session settlement state: pending attempts plus the set of references
/// that already settled. The settled set is never drained for the lifetime of
/// the session.
#[derive(Debug, Default)]
pub struct SettlementBook {
    pending: HashMap<String, PendingSettlement>,
    settled: HashSet<String>,
}

impl SettlementBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a cash settlement over the current cart. The reference is
    /// generated here, never taken from the client.
    pub fn initiate_cash(&mut self, cart: &Cart) -> Result<&PendingSettlement> {
        let reference = format!("cash-{}", Uuid::new_v4());
        self.initiate(cart, reference, SettlementMethod::Cash, None)
    }

    /// Start a gateway settlement, attaching the created order.
    pub fn initiate_gateway(&mut self, cart: &Cart, order: OrderHandle) -> Result<&PendingSettlement> {
        let reference = order.reference.clone();
        self.initiate(cart, reference, SettlementMethod::Gateway, Some(order))
    }

    fn initiate(
        &mut self,
        cart: &Cart,
        reference: String,
        method: SettlementMethod,
        order: Option<OrderHandle>,
    ) -> Result<&PendingSettlement> {
        if cart.is_empty() {
            return Err(MarketError::EmptyCart);
        }
        if self.settled.contains(&reference) {
            return Err(MarketError::DuplicateSettlement(reference));
        }
        let pending = PendingSettlement {
            reference: reference.clone(),
            method,
            amount: cart.total(),
            order,
            initiated_at: Utc::now(),
        };
        info!(%reference, ?method, amount = %pending.amount, "Settlement initiated");
        Ok(self.pending.entry(reference).or_insert(pending))
    }

    /// Pending settlement by reference.
    pub fn pending(&self, reference: &str) -> Result<&PendingSettlement> {
        self.pending
            .get(reference)
            .ok_or_else(|| MarketError::UnknownSettlement(reference.to_string()))
    }

    /// Confirm a pending settlement: deduct stock for every cart line, mark
    /// the lines final, and record the reference as settled. Runs fully
    /// synchronously under the session lock; stock is re-validated here, not
    /// trusted from initiation time. Deductions clamp at zero, so the stock
    /// invariant holds even if the vendor cut stock between the two phases.
    pub fn confirm(
        &mut self,
        reference: &str,
        cart: &mut Cart,
        ledger: &mut InventoryLedger,
    ) -> Result<SaleCompleted> {
        if self.settled.contains(reference) {
            return Err(MarketError::DuplicateSettlement(reference.to_string()));
        }
        let pending = self
            .pending
            .remove(reference)
            .ok_or_else(|| MarketError::UnknownSettlement(reference.to_string()))?;

        let mut lines = Vec::with_capacity(cart.lines().len());
        for line in cart.lines() {
            // Sell what is actually still on the shelf.
            let sold = ledger.deduct_stock(&line.product_id, line.quantity)?;
            if sold < line.quantity {
                warn!(
                    product_id = %line.product_id,
                    carted = %line.quantity,
                    %sold,
                    "Stock ran down before confirmation, selling remainder"
                );
            }
            if sold > Decimal::ZERO {
                lines.push(SoldLine {
                    product_id: line.product_id.clone(),
                    quantity: sold,
                    price: line.agreed_price,
                    total: sold * line.agreed_price,
                });
            }
        }
        let total = lines.iter().map(|l| l.total).sum();

        cart.finalize_all();
        self.settled.insert(reference.to_string());
        info!(%reference, %total, "Settlement confirmed");

        Ok(SaleCompleted {
            reference: pending.reference,
            method: pending.method,
            lines,
            total,
            settled_at: Utc::now(),
        })
    }

    /// Reject a pending settlement. The cart and stock are untouched; the
    /// reference can never be confirmed afterwards.
    pub fn reject(&mut self, reference: &str) -> Result<PendingSettlement> {
        let pending = self
            .pending
            .remove(reference)
            .ok_or_else(|| MarketError::UnknownSettlement(reference.to_string()))?;
        info!(%reference, "Settlement rejected");
        Ok(pending)
    }

    /// Whether a reference already settled.
    pub fn is_settled(&self, reference: &str) -> bool {
        self.settled.contains(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::test_support::{onion, tomato};
    use rust_decimal_macros::dec;

    fn setup() -> (InventoryLedger, Cart) {
        let mut ledger = InventoryLedger::new();
        ledger.replace(vec![tomato(), onion()]).unwrap();
        let mut cart = Cart::new();
        cart.add_item(&ledger, "vegetables-tomato", dec!(2)).unwrap();
        (ledger, cart)
    }

    #[test]
    fn test_cash_settlement_deducts_stock_once() {
        let (mut ledger, mut cart) = setup();
        let mut book = SettlementBook::new();

        let reference = book.initiate_cash(&cart).unwrap().reference.clone();
        let sale = book.confirm(&reference, &mut cart, &mut ledger).unwrap();

        assert_eq!(sale.total, dec!(90)); // 2kg at vendor price 45
        assert_eq!(ledger.stock("vegetables-tomato").unwrap(), dec!(3));
        assert!(cart
            .lines()
            .iter()
            .all(|l| l.status == crate::cart::LineStatus::Final));
    }

    // Duplicate confirmations are protocol errors and never double-deduct.
    #[test]
    fn test_confirmation_is_idempotent() {
        let (mut ledger, mut cart) = setup();
        let mut book = SettlementBook::new();

        let reference = book.initiate_cash(&cart).unwrap().reference.clone();
        book.confirm(&reference, &mut cart, &mut ledger).unwrap();

        assert!(matches!(
            book.confirm(&reference, &mut cart, &mut ledger),
            Err(MarketError::DuplicateSettlement(_))
        ));
        assert_eq!(ledger.stock("vegetables-tomato").unwrap(), dec!(3));
    }

    #[test]
    fn test_empty_cart_cannot_settle() {
        let cart = Cart::new();
        let mut book = SettlementBook::new();
        assert!(matches!(
            book.initiate_cash(&cart),
            Err(MarketError::EmptyCart)
        ));
    }

    #[test]
    fn test_reject_leaves_stock_untouched() {
        let (mut ledger, mut cart) = setup();
        let mut book = SettlementBook::new();

        let reference = book.initiate_cash(&cart).unwrap().reference.clone();
        book.reject(&reference).unwrap();

        assert_eq!(ledger.stock("vegetables-tomato").unwrap(), dec!(5));
        // Rejected references cannot be confirmed later.
        assert!(matches!(
            book.confirm(&reference, &mut cart, &mut ledger),
            Err(MarketError::UnknownSettlement(_))
        ));
    }

    #[test]
    fn test_confirm_clamps_when_stock_ran_down() {
        let (mut ledger, mut cart) = setup();
        let mut book = SettlementBook::new();

        let reference = book.initiate_cash(&cart).unwrap().reference.clone();
        // Vendor cuts stock to 1kg between initiation and confirmation.
        ledger.edit_stock("vegetables-tomato", dec!(1)).unwrap();

        let sale = book.confirm(&reference, &mut cart, &mut ledger).unwrap();
        assert_eq!(sale.lines[0].quantity, dec!(1));
        assert_eq!(sale.total, dec!(45));
        assert_eq!(ledger.stock("vegetables-tomato").unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_total_uses_agreed_prices() {
        let (mut ledger, mut cart) = setup();
        cart.apply_agreed_price("vegetables-tomato", dec!(35), crate::cart::LineStatus::Accepted);
        let mut book = SettlementBook::new();

        let reference = book.initiate_cash(&cart).unwrap().reference.clone();
        let sale = book.confirm(&reference, &mut cart, &mut ledger).unwrap();
        assert_eq!(sale.total, dec!(70));
    }

    #[test]
    fn test_gateway_settlement_carries_order() {
        let (_ledger, cart) = setup();
        let mut book = SettlementBook::new();

        let order = OrderHandle {
            order_id: "order_123".into(),
            amount: dec!(90),
            reference: "rcpt-abc".into(),
        };
        let pending = book.initiate_gateway(&cart, order).unwrap();
        assert_eq!(pending.method, SettlementMethod::Gateway);
        assert_eq!(pending.reference, "rcpt-abc");
        assert_eq!(pending.order.as_ref().unwrap().order_id, "order_123");
    }
}
