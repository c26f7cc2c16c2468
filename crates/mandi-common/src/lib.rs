//! Shared types for the mandi-live marketplace server.
//!
//! CRITICAL: All prices (rupees) and quantities (kilograms) use
//! `rust_decimal::Decimal`. NEVER use f64 for money or weight math.

pub mod types;

pub use types::*;
