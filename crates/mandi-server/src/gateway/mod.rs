//! Realtime WebSocket gateway.
//!
//! `server` owns connections and routing; `handlers` owns the protocol
//! logic; `events` defines the wire frames. All session mutation happens
//! under the session lock inside `handlers`, and every emission is planned
//! while mutating but sent only after the lock is released.

pub mod events;
pub mod handlers;
pub mod server;

use std::sync::Arc;

use crate::negotiation::Narrator;
use crate::oracle::{PaymentGateway, PricingOracle};
use crate::relay::MessageRelay;
use crate::session::SharedSessionStore;

/// Everything the protocol handlers need, bundled for injection. Tests swap
/// the oracle implementations for mocks.
pub struct CoreServices {
    pub store: SharedSessionStore,
    pub pricing: Arc<dyn PricingOracle>,
    pub narrator: Narrator,
    pub relay: MessageRelay,
    pub payments: Arc<dyn PaymentGateway>,
}

pub type SharedCoreServices = Arc<CoreServices>;
