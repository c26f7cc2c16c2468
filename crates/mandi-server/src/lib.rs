//! Realtime vendor/customer marketplace server.
//!
//! One vendor and one customer meet in a short-code session. The server is
//! the single authority for inventory, cart, negotiation, and settlement
//! state; clients only ever see projections of it, and the vendor's floor
//! prices never cross the wire to the customer.
//!
//! ## Modules
//!
//! - `session`: session store, role tokens, per-session state
//! - `inventory`: product ledger with the stock invariant
//! - `cart`: server-side cart validated against the ledger
//! - `negotiation`: the offer state machine and counter-offer math
//! - `settlement`: two-phase settlement with idempotent confirmation
//! - `oracle`: external collaborator traits plus Gemini/Razorpay clients
//! - `relay`: chat transform/translation relay
//! - `gateway`: WebSocket server and protocol handlers
//! - `api`: REST endpoints

pub mod api;
pub mod cart;
pub mod config;
pub mod error;
pub mod gateway;
pub mod inventory;
pub mod negotiation;
pub mod oracle;
pub mod relay;
pub mod session;
pub mod settlement;

pub use config::ServerConfig;
pub use error::{ErrorKind, MarketError};
pub use gateway::handlers::{core_services, ClientBinding, Dispatcher};
pub use gateway::{CoreServices, SharedCoreServices};
pub use session::{SessionStore, SharedSessionStore};
