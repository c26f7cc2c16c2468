//! Session lifecycle and the session store.
//!
//! A session is one vendor/one customer. The vendor creates it and gets a
//! joinable code; the customer joins by code. Each participant holds a
//! session-scoped role token issued at creation/join time, and every
//! privileged operation checks the token, not the connection it arrived on.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mandi_common::{generate_session_code, Language, Role};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cart::Cart;
use crate::error::{MarketError, Result};
use crate::inventory::InventoryLedger;
use crate::negotiation::NegotiationBook;
use crate::relay::RelayedMessage;
use crate::settlement::SettlementBook;

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created by the vendor, waiting for a customer.
    Waiting,
    /// Both parties present.
    Active,
    /// A participant dropped; negotiation state was cleared.
    Disconnected,
}

/// All state for one marketplace session. Guarded by one mutex in the store;
/// the lock is never held across an await.
#[derive(Debug)]
pub struct Session {
    pub code: String,
    pub status: SessionStatus,
    pub vendor_language: Language,
    pub customer_language: Option<Language>,
    vendor_token: Uuid,
    customer_token: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub inventory: InventoryLedger,
    pub cart: Cart,
    pub negotiations: NegotiationBook,
    pub settlements: SettlementBook,
    pub messages: Vec<RelayedMessage>,
}

impl Session {
    fn new(code: String, vendor_language: Language) -> Self {
        Self {
            code,
            status: SessionStatus::Waiting,
            vendor_language,
            customer_language: None,
            vendor_token: Uuid::new_v4(),
            customer_token: None,
            created_at: Utc::now(),
            inventory: InventoryLedger::new(),
            cart: Cart::new(),
            negotiations: NegotiationBook::new(),
            settlements: SettlementBook::new(),
            messages: Vec::new(),
        }
    }

    /// Token issued to the vendor at creation.
    pub fn vendor_token(&self) -> Uuid {
        self.vendor_token
    }

    /// Admit the customer. A session holds at most one; a second join is
    /// rejected without disturbing the first.
    pub fn join(&mut self, language: Language) -> Result<Uuid> {
        if self.customer_token.is_some() {
            return Err(MarketError::SessionOccupied(self.code.clone()));
        }
        let token = Uuid::new_v4();
        self.customer_token = Some(token);
        self.customer_language = Some(language);
        self.status = SessionStatus::Active;
        info!(session = %self.code, language = language.code(), "Customer joined");
        Ok(token)
    }

    /// Resolve a token to its role, or reject.
    pub fn authorize(&self, token: Uuid) -> Result<Role> {
        if token == self.vendor_token {
            Ok(Role::Vendor)
        } else if self.customer_token == Some(token) {
            Ok(Role::Customer)
        } else {
            Err(MarketError::Unauthorized {
                required: Role::Vendor,
            })
        }
    }

    /// Check the token belongs to the vendor.
    pub fn require_vendor(&self, token: Uuid) -> Result<()> {
        if token == self.vendor_token {
            Ok(())
        } else {
            Err(MarketError::Unauthorized {
                required: Role::Vendor,
            })
        }
    }

    /// Check the token belongs to the customer.
    pub fn require_customer(&self, token: Uuid) -> Result<()> {
        if self.customer_token == Some(token) {
            Ok(())
        } else {
            Err(MarketError::Unauthorized {
                required: Role::Customer,
            })
        }
    }

    /// The working language of a role. The vendor's is fixed at creation;
    /// the customer's defaults to the vendor's until someone joins.
    pub fn language_of(&self, role: Role) -> Language {
        match role {
            Role::Vendor => self.vendor_language,
            Role::Customer => self.customer_language.unwrap_or(self.vendor_language),
        }
    }

    /// Mark the session torn by a disconnect. In-flight negotiations are
    /// cleared; inventory, cart, and settled references survive so a refresh
    /// does not lose the sale.
    pub fn mark_disconnected(&mut self, role: Role) {
        warn!(session = %self.code, role = %role, "Participant disconnected");
        self.status = SessionStatus::Disconnected;
        self.negotiations.clear();
    }

    /// Append a relayed chat message to the transcript.
    pub fn record_message(&mut self, message: RelayedMessage) {
        self.messages.push(message);
    }
}

pub type SharedSession = Arc<Mutex<Session>>;

/// All live sessions, keyed by join code. An explicit store object rather
/// than process-global state, so tests can run stores side by side.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<String, SharedSession>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session with a fresh join code, retrying on the (unlikely)
    /// code collision.
    pub fn create(&self, vendor_language: Language) -> (String, Uuid, SharedSession) {
        loop {
            let code = generate_session_code();
            if self.sessions.contains_key(&code) {
                continue;
            }
            let session = Session::new(code.clone(), vendor_language);
            let vendor_token = session.vendor_token();
            let shared = Arc::new(Mutex::new(session));
            self.sessions.insert(code.clone(), Arc::clone(&shared));
            info!(session = %code, "Session created");
            return (code, vendor_token, shared);
        }
    }

    /// Look up a live session by code.
    pub fn get(&self, code: &str) -> Result<SharedSession> {
        self.sessions
            .get(code)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MarketError::SessionNotFound(code.to_string()))
    }

    /// Drop a session entirely.
    pub fn remove(&self, code: &str) {
        if self.sessions.remove(code).is_some() {
            info!(session = %code, "Session removed");
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

pub type SharedSessionStore = Arc<SessionStore>;
