//! Per-session inventory ledger.
//!
//! Holds the vendor's product list with stock and price fields. Enforces the
//! stock invariant (stock >= 0 at all times: any operation that would drive
//! it negative is rejected before mutation) and strips the floor price from
//! everything the customer can see.

use mandi_common::ProductCategory;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MarketError, Result};

/// A product as the vendor registers it. The floor price is optional on the
/// wire; negotiation for a product without one fails with a config error
/// rather than silently defaulting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    /// Stable identifier across the session (e.g. "vegetables-tomato").
    pub id: String,
    /// Display name.
    pub name: String,
    /// Category.
    pub category: ProductCategory,
    /// Market reference price per kg (from the pricing oracle).
    pub market_price: Decimal,
    /// Vendor's asking price per kg.
    pub vendor_price: Decimal,
    /// Minimum acceptable price per kg. Never exposed to the customer.
    pub floor_price: Option<Decimal>,
    /// Available stock in kilograms. Fractional quantities allowed.
    pub stock: Decimal,
}

/// Customer-facing product view: same fields minus the floor price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductView {
    pub id: String,
    pub name: String,
    pub category: ProductCategory,
    pub market_price: Decimal,
    pub vendor_price: Decimal,
    pub stock: Decimal,
}

impl Product {
    /// Strip the floor price for broadcast.
    pub fn view(&self) -> ProductView {
        ProductView {
            id: self.id.clone(),
            name: self.name.clone(),
            category: self.category,
            market_price: self.market_price,
            vendor_price: self.vendor_price,
            stock: self.stock,
        }
    }
}

/// Notification payload emitted when a vendor stock reduction leaves a cart
/// line holding more than the new stock.
#[derive(Debug, Clone, Serialize)]
pub struct StockShrink {
    pub product_id: String,
    pub new_stock: Decimal,
    pub cart_quantity: Decimal,
}

/// The session's mutable product list.
#[derive(Debug, Default)]
pub struct InventoryLedger {
    products: Vec<Product>,
}

impl InventoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole product list. Rejects negative stock or
    /// non-positive prices before touching existing state.
    pub fn replace(&mut self, products: Vec<Product>) -> Result<()> {
        Self::validate(&products)?;
        debug!(count = products.len(), "Inventory replaced");
        self.products = products;
        Ok(())
    }

    /// Merge additional products into an active session. Existing products
    /// with the same id are overwritten; everything else is untouched, so
    /// cart and negotiation state for other products survives.
    pub fn append(&mut self, products: Vec<Product>) -> Result<()> {
        Self::validate(&products)?;
        for incoming in products {
            match self.products.iter_mut().find(|p| p.id == incoming.id) {
                Some(existing) => *existing = incoming,
                None => self.products.push(incoming),
            }
        }
        Ok(())
    }

    fn validate(products: &[Product]) -> Result<()> {
        for p in products {
            if p.stock < Decimal::ZERO {
                return Err(MarketError::NegativeStock(p.id.clone()));
            }
            if p.vendor_price <= Decimal::ZERO || p.market_price <= Decimal::ZERO {
                return Err(MarketError::NonPositivePrice);
            }
            if matches!(p.floor_price, Some(f) if f <= Decimal::ZERO) {
                return Err(MarketError::NonPositivePrice);
            }
        }
        Ok(())
    }

    /// Look up a product.
    pub fn get(&self, product_id: &str) -> Result<&Product> {
        self.products
            .iter()
            .find(|p| p.id == product_id)
            .ok_or_else(|| MarketError::UnknownProduct(product_id.to_string()))
    }

    /// Current stock for a product.
    pub fn stock(&self, product_id: &str) -> Result<Decimal> {
        self.get(product_id).map(|p| p.stock)
    }

    /// Floor price for a product, or a config error if none was registered.
    pub fn floor_price(&self, product_id: &str) -> Result<Decimal> {
        self.get(product_id)?
            .floor_price
            .ok_or_else(|| MarketError::MissingFloorPrice(product_id.to_string()))
    }

    /// Update the vendor price of one product.
    pub fn edit_price(&mut self, product_id: &str, new_price: Decimal) -> Result<()> {
        if new_price <= Decimal::ZERO {
            return Err(MarketError::NonPositivePrice);
        }
        let product = self.get_mut(product_id)?;
        debug!(product_id, %new_price, "Vendor price edited");
        product.vendor_price = new_price;
        Ok(())
    }

    /// Update the floor price of one product.
    pub fn edit_floor_price(&mut self, product_id: &str, new_floor: Decimal) -> Result<()> {
        if new_floor <= Decimal::ZERO {
            return Err(MarketError::NonPositivePrice);
        }
        self.get_mut(product_id)?.floor_price = Some(new_floor);
        Ok(())
    }

    /// Set the stock of one product. Returns the new stock level.
    /// Negative quantities are rejected before mutation.
    pub fn edit_stock(&mut self, product_id: &str, new_stock: Decimal) -> Result<Decimal> {
        if new_stock < Decimal::ZERO {
            return Err(MarketError::NegativeStock(product_id.to_string()));
        }
        let product = self.get_mut(product_id)?;
        debug!(product_id, %new_stock, "Stock edited");
        product.stock = new_stock;
        Ok(new_stock)
    }

    /// Deduct sold quantity, clamped at zero. Returns the quantity actually
    /// deducted, which may be less than requested if stock ran down between
    /// settlement initiation and confirmation.
    pub fn deduct_stock(&mut self, product_id: &str, quantity: Decimal) -> Result<Decimal> {
        let product = self.get_mut(product_id)?;
        let deducted = quantity.min(product.stock);
        product.stock -= deducted;
        Ok(deducted)
    }

    /// Customer-facing views of every product, in registration order.
    pub fn views(&self) -> Vec<ProductView> {
        self.products.iter().map(Product::view).collect()
    }

    /// Number of registered products.
    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    fn get_mut(&mut self, product_id: &str) -> Result<&mut Product> {
        self.products
            .iter_mut()
            .find(|p| p.id == product_id)
            .ok_or_else(|| MarketError::UnknownProduct(product_id.to_string()))
    }
}
