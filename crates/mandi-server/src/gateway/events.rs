//! Wire protocol for the realtime gateway.
//!
//! Clients send `ClientEvent` frames as JSON text messages; the server
//! answers with `ServerEvent` frames. Every privileged event carries the
//! sender's role token. Floor prices never appear in any customer-facing
//! payload; the vendor-only events are the single place they surface.

use mandi_common::{Language, Role};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cart::CartLine;
use crate::error::ErrorKind;
use crate::inventory::{Product, ProductView, StockShrink};
use crate::negotiation::{NegotiationStatus, VendorResponse};
use crate::settlement::{SaleCompleted, SettlementMethod};

/// Events a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Vendor opens a new session.
    CreateSession { language: Language },

    /// Customer joins an existing session by code.
    JoinSession {
        session_id: String,
        language: Language,
    },

    /// Vendor replaces the whole product list.
    UpdateInventory { token: Uuid, products: Vec<Product> },

    /// Vendor merges additional products into the list.
    AppendInventory { token: Uuid, products: Vec<Product> },

    /// Vendor edits one product's asking price.
    EditPrice {
        token: Uuid,
        product_id: String,
        price: Decimal,
    },

    /// Vendor edits one product's floor price.
    EditFloorPrice {
        token: Uuid,
        product_id: String,
        floor_price: Decimal,
    },

    /// Vendor edits one product's stock.
    EditStock {
        token: Uuid,
        product_id: String,
        stock: Decimal,
    },

    /// Either party asks for the current product list.
    GetProducts { token: Uuid },

    /// Customer adds quantity of a product to the cart.
    CartAdd {
        token: Uuid,
        product_id: String,
        quantity: Decimal,
    },

    /// Customer sets a cart line's quantity (zero removes it).
    CartSetQuantity {
        token: Uuid,
        product_id: String,
        quantity: Decimal,
    },

    /// Customer removes a cart line.
    CartRemove { token: Uuid, product_id: String },

    /// Customer proposes a price for a product. The market price is taken
    /// from the ledger, never from the client.
    ProposePrice {
        token: Uuid,
        product_id: String,
        offer: Decimal,
        round: u32,
    },

    /// Vendor answers an offer awaiting approval.
    RespondNegotiation {
        token: Uuid,
        product_id: String,
        response: VendorResponse,
    },

    /// Customer starts a cash settlement over the current cart.
    InitiateCashSettlement { token: Uuid },

    /// Vendor confirms cash was received.
    ConfirmCashSettlement { token: Uuid, reference: String },

    /// Vendor rejects a pending cash settlement.
    RejectCashSettlement { token: Uuid, reference: String },

    /// Customer starts an online settlement; the server creates the order.
    InitiateGatewaySettlement { token: Uuid },

    /// Customer reports a completed online payment for verification.
    ConfirmGatewaySettlement {
        token: Uuid,
        reference: String,
        payment_id: String,
        signature: String,
    },

    /// Either party sends a chat message to the counterparty.
    SendMessage { token: Uuid, text: String },
}

/// A negotiation snapshot without vendor-only fields.
#[derive(Debug, Clone, Serialize)]
pub struct NegotiationUpdate {
    pub product_id: String,
    pub status: NegotiationStatus,
    pub round: u32,
    /// The counter narrative sent to the customer, rendered in the
    /// recipient's working language.
    pub narrative: String,
}

/// Events the server sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// To the vendor after `create-session`.
    SessionCreated { session_id: String, role_token: Uuid },

    /// To the customer after `join-session`, with the current catalog.
    SessionJoined {
        session_id: String,
        role_token: Uuid,
        vendor_language: Language,
        products: Vec<ProductView>,
    },

    /// To the vendor when the customer joins.
    CustomerJoined { language: Language },

    /// Catalog changed; floor prices already stripped.
    InventoryUpdated { products: Vec<ProductView> },

    /// A stock cut forced a cart line down.
    StockShrunk(StockShrink),

    /// Vendor-side mirror of the reconciled cart. The customer keeps
    /// optimistic local state and is corrected through explicit frames
    /// (`CartRejected`, `StockShrunk`, `NegotiationResolved`).
    CartUpdated {
        lines: Vec<CartLine>,
        total: Decimal,
    },

    /// A cart mutation was rejected; carries everything needed for an
    /// actionable message.
    CartRejected {
        product_id: String,
        requested: Decimal,
        available: Decimal,
        in_cart: Decimal,
        message: String,
    },

    /// Vendor only: an offer cleared the floor and awaits a decision.
    ApprovalRequested {
        product_id: String,
        proposed_price: Decimal,
        floor_price: Decimal,
        market_price: Decimal,
        round: u32,
    },

    /// Customer only: the offer went to the vendor.
    OfferForwarded { product_id: String, round: u32 },

    /// Customer only: a below-floor offer was countered.
    CounterOffer {
        product_id: String,
        narrative: String,
        suggested_min: Decimal,
        suggested_max: Decimal,
        round: u32,
        /// True when this was the closing round.
        negotiation_over: bool,
    },

    /// Vendor only: a below-floor offer was countered automatically.
    NegotiationProgress(NegotiationUpdate),

    /// Both parties: a negotiation reached a resolution.
    NegotiationResolved {
        product_id: String,
        status: NegotiationStatus,
        final_price: Option<Decimal>,
    },

    /// Vendor only: a settlement awaits confirmation.
    SettlementRequested {
        reference: String,
        method: SettlementMethod,
        amount: Decimal,
    },

    /// Customer only: the gateway order to pay against.
    GatewayOrderCreated {
        reference: String,
        order_id: String,
        amount: Decimal,
    },

    /// Broadcast: the sale went through.
    SaleCompleted(SaleCompleted),

    /// Customer only: the vendor turned the settlement down.
    SettlementRejected { reference: String },

    /// Counterparty's transformed chat message.
    MessageReceived {
        from: Role,
        text: String,
        sentiment: Option<String>,
        language: Language,
    },

    /// Echo to the sender: original text plus what was delivered.
    MessageSent { original: String, delivered: String },

    /// The other participant dropped.
    UserDisconnected { role: Role },

    /// Request failed.
    Error { kind: ErrorKind, message: String },
}

impl ServerEvent {
    /// Build an error frame from a core error.
    pub fn from_error(err: &crate::error::MarketError) -> Self {
        ServerEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
