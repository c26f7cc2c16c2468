//! Server-side authoritative cart.
//!
//! Every mutation is validated against the inventory ledger before it is
//! accepted, so a cart line's quantity can never exceed the product's current
//! stock. Rejections carry the available stock and the existing cart quantity
//! so the client can render an actionable message.

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::error::{MarketError, Result};
use crate::inventory::{InventoryLedger, StockShrink};

/// Lifecycle of a cart line's price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LineStatus {
    /// In the cart at the list price.
    Added,
    /// Price agreed through negotiation.
    Accepted,
    /// Last negotiation for this product was rejected; list price stands.
    Rejected,
    /// Settled; no further changes.
    Final,
}

/// One product line in the customer's cart.
#[derive(Debug, Clone, Serialize)]
pub struct CartLine {
    pub product_id: String,
    pub quantity: Decimal,
    /// List price snapshot taken when the line was created.
    pub original_price: Decimal,
    /// Currently agreed price. Starts at the list price and changes only
    /// through accepted negotiation or a vendor price edit.
    pub agreed_price: Decimal,
    pub status: LineStatus,
}

impl CartLine {
    /// Line total at the agreed price.
    pub fn total(&self) -> Decimal {
        self.quantity * self.agreed_price
    }
}

/// The session's cart. Mutated only by customer cart operations,
/// vendor stock reductions (force-shrink), and settlement.
#[derive(Debug, Default)]
pub struct Cart {
    lines: Vec<CartLine>,
}

impl Cart {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add quantity of a product. Rejects, without partial application, if
    /// the existing cart quantity plus the requested quantity exceeds stock.
    pub fn add_item(
        &mut self,
        ledger: &InventoryLedger,
        product_id: &str,
        quantity: Decimal,
    ) -> Result<()> {
        if quantity <= Decimal::ZERO {
            return Err(MarketError::NonPositiveQuantity);
        }
        let product = ledger.get(product_id)?;
        let in_cart = self.quantity_of(product_id);

        if in_cart + quantity > product.stock {
            return Err(MarketError::StockExceeded {
                product_id: product_id.to_string(),
                requested: quantity,
                available: product.stock,
                in_cart,
            });
        }

        match self.line_mut(product_id) {
            Some(line) => line.quantity += quantity,
            None => self.lines.push(CartLine {
                product_id: product_id.to_string(),
                quantity,
                original_price: product.vendor_price,
                agreed_price: product.vendor_price,
                status: LineStatus::Added,
            }),
        }
        debug!(product_id, %quantity, "Cart item added");
        Ok(())
    }

    /// Set the quantity of a line. Zero removes the line entirely.
    pub fn set_quantity(
        &mut self,
        ledger: &InventoryLedger,
        product_id: &str,
        new_quantity: Decimal,
    ) -> Result<()> {
        if new_quantity < Decimal::ZERO {
            return Err(MarketError::NonPositiveQuantity);
        }
        let product = ledger.get(product_id)?;

        if new_quantity.is_zero() {
            self.remove_item(product_id);
            return Ok(());
        }

        if new_quantity > product.stock {
            return Err(MarketError::StockExceeded {
                product_id: product_id.to_string(),
                requested: new_quantity,
                available: product.stock,
                in_cart: self.quantity_of(product_id),
            });
        }

        match self.line_mut(product_id) {
            Some(line) => line.quantity = new_quantity,
            None => self.lines.push(CartLine {
                product_id: product_id.to_string(),
                quantity: new_quantity,
                original_price: product.vendor_price,
                agreed_price: product.vendor_price,
                status: LineStatus::Added,
            }),
        }
        Ok(())
    }

    /// Remove a line. Always permitted; removing an absent line is a no-op.
    pub fn remove_item(&mut self, product_id: &str) {
        self.lines.retain(|l| l.product_id != product_id);
    }

    /// Reconcile a line against a vendor stock reduction. If the line holds
    /// more than the new stock it is force-shrunk and a notification payload
    /// is returned for the customer.
    pub fn reconcile_stock(&mut self, product_id: &str, new_stock: Decimal) -> Option<StockShrink> {
        let held = self.line(product_id)?.quantity;
        if held <= new_stock {
            return None;
        }
        if new_stock.is_zero() {
            self.remove_item(product_id);
        } else if let Some(line) = self.line_mut(product_id) {
            line.quantity = new_stock;
        }
        debug!(product_id, %new_stock, %held, "Cart line force-shrunk");
        Some(StockShrink {
            product_id: product_id.to_string(),
            new_stock,
            cart_quantity: held,
        })
    }

    /// Record an agreed price from a successful negotiation.
    pub fn apply_agreed_price(&mut self, product_id: &str, price: Decimal, status: LineStatus) {
        if let Some(line) = self.line_mut(product_id) {
            line.agreed_price = price;
            line.status = status;
        }
    }

    /// Mark a line rejected (list price stands).
    pub fn mark_rejected(&mut self, product_id: &str) {
        if let Some(line) = self.line_mut(product_id) {
            line.status = LineStatus::Rejected;
        }
    }

    /// Mark every line final after settlement.
    pub fn finalize_all(&mut self) {
        for line in &mut self.lines {
            line.status = LineStatus::Final;
        }
    }

    /// Quantity currently carted for a product (zero if absent).
    pub fn quantity_of(&self, product_id: &str) -> Decimal {
        self.line(product_id)
            .map(|l| l.quantity)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn line(&self, product_id: &str) -> Option<&CartLine> {
        self.lines.iter().find(|l| l.product_id == product_id)
    }

    fn line_mut(&mut self, product_id: &str) -> Option<&mut CartLine> {
        self.lines.iter_mut().find(|l| l.product_id == product_id)
    }

    pub fn lines(&self) -> &[CartLine] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Cart total at agreed prices.
    pub fn total(&self) -> Decimal {
        self.lines.iter().map(CartLine::total).sum()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::test_support::{onion, tomato};
    use rust_decimal_macros::dec;

    fn ledger() -> InventoryLedger {
        let mut ledger = InventoryLedger::new();
        ledger.replace(vec![tomato(), onion()]).unwrap();
        ledger
    }

    #[test]
    fn test_add_within_stock() {
        let ledger = ledger();
        let mut cart = Cart::new();
        cart.add_item(&ledger, "vegetables-tomato", dec!(2.5)).unwrap();
        assert_eq!(cart.quantity_of("vegetables-tomato"), dec!(2.5));
        assert_eq!(cart.line("vegetables-tomato").unwrap().agreed_price, dec!(45));
    }

    // Scenario D: cart holds 2kg of a product with stock 2kg; adding 1kg more
    // is rejected carrying available=2 and in_cart=2.
    #[test]
    fn test_add_rejected_when_stock_exhausted() {
        let ledger = ledger();
        let mut cart = Cart::new();
        cart.add_item(&ledger, "vegetables-onion", dec!(2)).unwrap();

        let err = cart
            .add_item(&ledger, "vegetables-onion", dec!(1))
            .unwrap_err();
        match err {
            MarketError::StockExceeded {
                available, in_cart, ..
            } => {
                assert_eq!(available, dec!(2));
                assert_eq!(in_cart, dec!(2));
            }
            other => panic!("expected StockExceeded, got {other:?}"),
        }
        // Rejection did not partially apply
        assert_eq!(cart.quantity_of("vegetables-onion"), dec!(2));
    }

    #[test]
    fn test_set_quantity_zero_removes_line() {
        let ledger = ledger();
        let mut cart = Cart::new();
        cart.add_item(&ledger, "vegetables-tomato", dec!(1)).unwrap();
        cart.set_quantity(&ledger, "vegetables-tomato", Decimal::ZERO)
            .unwrap();
        assert!(cart.is_empty());
    }

    #[test]
    fn test_set_quantity_validates_stock() {
        let ledger = ledger();
        let mut cart = Cart::new();
        assert!(matches!(
            cart.set_quantity(&ledger, "vegetables-onion", dec!(3)),
            Err(MarketError::StockExceeded { .. })
        ));
    }

    #[test]
    fn test_unknown_product_rejected_outright() {
        let ledger = ledger();
        let mut cart = Cart::new();
        assert!(matches!(
            cart.add_item(&ledger, "fruits-durian", dec!(1)),
            Err(MarketError::UnknownProduct(_))
        ));
    }

    // Scenario E: stock drops from 5kg to 1kg while 3kg is carted; the line
    // shrinks and the notification carries new_stock=1, cart_quantity=3.
    #[test]
    fn test_reconcile_stock_shrinks_line() {
        let mut ledger = ledger();
        let mut cart = Cart::new();
        cart.add_item(&ledger, "vegetables-tomato", dec!(3)).unwrap();

        ledger.edit_stock("vegetables-tomato", dec!(1)).unwrap();
        let shrink = cart.reconcile_stock("vegetables-tomato", dec!(1)).unwrap();

        assert_eq!(shrink.new_stock, dec!(1));
        assert_eq!(shrink.cart_quantity, dec!(3));
        assert_eq!(cart.quantity_of("vegetables-tomato"), dec!(1));
    }

    #[test]
    fn test_reconcile_stock_no_shrink_needed() {
        let mut cart = Cart::new();
        let ledger = ledger();
        cart.add_item(&ledger, "vegetables-tomato", dec!(1)).unwrap();
        assert!(cart.reconcile_stock("vegetables-tomato", dec!(4)).is_none());
    }

    #[test]
    fn test_reconcile_to_zero_removes_line() {
        let ledger = ledger();
        let mut cart = Cart::new();
        cart.add_item(&ledger, "vegetables-tomato", dec!(2)).unwrap();
        let shrink = cart
            .reconcile_stock("vegetables-tomato", Decimal::ZERO)
            .unwrap();
        assert_eq!(shrink.cart_quantity, dec!(2));
        assert!(cart.is_empty());
    }

    #[test]
    fn test_total_uses_agreed_prices() {
        let ledger = ledger();
        let mut cart = Cart::new();
        cart.add_item(&ledger, "vegetables-tomato", dec!(2)).unwrap();
        cart.apply_agreed_price("vegetables-tomato", dec!(35), LineStatus::Accepted);
        assert_eq!(cart.total(), dec!(70));
        assert_eq!(
            cart.line("vegetables-tomato").unwrap().original_price,
            dec!(45)
        );
    }
}
