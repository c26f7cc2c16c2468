//! Protocol handlers: one entry point per client event.
//!
//! Invariants enforced here:
//! - the session lock is never held across an await; oracle calls happen
//!   between two lock scopes, and the second scope re-validates
//! - state is mutated before any frame is planned, and frames are sent by
//!   the caller only after every lock is released
//! - role checks are by token, never by connection identity

use std::sync::Arc;

use mandi_common::Role;
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use super::events::{ClientEvent, NegotiationUpdate, ServerEvent};
use super::SharedCoreServices;
use crate::error::{ErrorKind, MarketError, Result};
use crate::negotiation::{OfferClassification, VendorResponse};
use crate::oracle::NarrativeRequest;
use crate::session::SharedSession;

/// Who a planned frame goes to, resolved by the connection layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The connection that sent the event.
    Requester,
    Vendor,
    Customer,
    Both,
}

/// A frame planned during handling, delivered after all locks are released.
#[derive(Debug)]
pub struct Outbound {
    pub to: Target,
    pub event: ServerEvent,
}

impl Outbound {
    fn new(to: Target, event: ServerEvent) -> Self {
        Self { to, event }
    }
}

/// The session/role a connection was bound to at create/join time.
#[derive(Debug, Clone)]
pub struct ClientBinding {
    pub session: String,
    pub role: Role,
}

/// Result of handling one event.
#[derive(Debug, Default)]
pub struct HandlerOutcome {
    pub outbound: Vec<Outbound>,
    /// Set when the event established a session binding.
    pub bind: Option<ClientBinding>,
}

impl HandlerOutcome {
    fn frames(outbound: Vec<Outbound>) -> Self {
        Self {
            outbound,
            bind: None,
        }
    }

    fn error(err: &MarketError) -> Self {
        Self::frames(vec![Outbound::new(
            Target::Requester,
            ServerEvent::from_error(err),
        )])
    }
}

/// Stateless event dispatcher over the shared services.
pub struct Dispatcher {
    services: SharedCoreServices,
}

impl Dispatcher {
    pub fn new(services: SharedCoreServices) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &SharedCoreServices {
        &self.services
    }

    /// Handle one client event. `binding` is the connection's session
    /// binding, absent until create/join succeeds.
    pub async fn handle(
        &self,
        binding: Option<&ClientBinding>,
        event: ClientEvent,
    ) -> HandlerOutcome {
        match event {
            ClientEvent::CreateSession { language } => self.create_session(language),
            ClientEvent::JoinSession {
                session_id,
                language,
            } => self.join_session(&session_id, language),
            other => {
                let Some(binding) = binding else {
                    return HandlerOutcome::frames(vec![Outbound::new(
                        Target::Requester,
                        ServerEvent::Error {
                            kind: ErrorKind::Protocol,
                            message: "create or join a session first".to_string(),
                        },
                    )]);
                };
                match self.dispatch_bound(binding, other).await {
                    Ok(outbound) => HandlerOutcome::frames(outbound),
                    Err(e) => HandlerOutcome::error(&e),
                }
            }
        }
    }

    async fn dispatch_bound(
        &self,
        binding: &ClientBinding,
        event: ClientEvent,
    ) -> Result<Vec<Outbound>> {
        let session = self.services.store.get(&binding.session)?;
        match event {
            ClientEvent::UpdateInventory { token, products } => {
                self.update_inventory(&session, token, products, true)
            }
            ClientEvent::AppendInventory { token, products } => {
                self.update_inventory(&session, token, products, false)
            }
            ClientEvent::EditPrice {
                token,
                product_id,
                price,
            } => self.edit_price(&session, token, &product_id, price),
            ClientEvent::EditFloorPrice {
                token,
                product_id,
                floor_price,
            } => self.edit_floor_price(&session, token, &product_id, floor_price),
            ClientEvent::EditStock {
                token,
                product_id,
                stock,
            } => self.edit_stock(&session, token, &product_id, stock),
            ClientEvent::GetProducts { token } => self.get_products(&session, token),
            ClientEvent::CartAdd {
                token,
                product_id,
                quantity,
            } => self.cart_mutation(&session, token, |session| {
                session.cart.add_item(&session.inventory, &product_id, quantity)
            }),
            ClientEvent::CartSetQuantity {
                token,
                product_id,
                quantity,
            } => self.cart_mutation(&session, token, |session| {
                session
                    .cart
                    .set_quantity(&session.inventory, &product_id, quantity)
            }),
            ClientEvent::CartRemove { token, product_id } => {
                self.cart_mutation(&session, token, |session| {
                    session.cart.remove_item(&product_id);
                    Ok(())
                })
            }
            ClientEvent::ProposePrice {
                token,
                product_id,
                offer,
                round,
            } => {
                self.propose_price(&session, token, &product_id, offer, round)
                    .await
            }
            ClientEvent::RespondNegotiation {
                token,
                product_id,
                response,
            } => {
                self.respond_negotiation(&session, token, &product_id, response)
                    .await
            }
            ClientEvent::InitiateCashSettlement { token } => {
                self.initiate_cash(&session, token)
            }
            ClientEvent::ConfirmCashSettlement { token, reference } => {
                self.confirm_settlement(&session, token, &reference, Role::Vendor)
            }
            ClientEvent::RejectCashSettlement { token, reference } => {
                self.reject_settlement(&session, token, &reference)
            }
            ClientEvent::InitiateGatewaySettlement { token } => {
                self.initiate_gateway(&session, token).await
            }
            ClientEvent::ConfirmGatewaySettlement {
                token,
                reference,
                payment_id,
                signature,
            } => {
                self.confirm_gateway(&session, token, &reference, &payment_id, &signature)
                    .await
            }
            ClientEvent::SendMessage { token, text } => {
                self.send_message(&session, token, &text).await
            }
            ClientEvent::CreateSession { .. } | ClientEvent::JoinSession { .. } => {
                unreachable!("handled before dispatch_bound")
            }
        }
    }

    // === Session lifecycle ===

    fn create_session(&self, language: mandi_common::Language) -> HandlerOutcome {
        let (code, vendor_token, _session) = self.services.store.create(language);
        info!(session = %code, "Vendor opened session");
        HandlerOutcome {
            outbound: vec![Outbound::new(
                Target::Requester,
                ServerEvent::SessionCreated {
                    session_id: code.clone(),
                    role_token: vendor_token,
                },
            )],
            bind: Some(ClientBinding {
                session: code,
                role: Role::Vendor,
            }),
        }
    }

    fn join_session(&self, code: &str, language: mandi_common::Language) -> HandlerOutcome {
        let result: Result<HandlerOutcome> = (|| {
            let session = self.services.store.get(code)?;
            let mut guard = session.lock();
            let role_token = guard.join(language)?;
            let vendor_language = guard.vendor_language;
            let products = guard.inventory.views();
            drop(guard);

            Ok(HandlerOutcome {
                outbound: vec![
                    Outbound::new(
                        Target::Requester,
                        ServerEvent::SessionJoined {
                            session_id: code.to_string(),
                            role_token,
                            vendor_language,
                            products,
                        },
                    ),
                    Outbound::new(Target::Vendor, ServerEvent::CustomerJoined { language }),
                ],
                bind: Some(ClientBinding {
                    session: code.to_string(),
                    role: Role::Customer,
                }),
            })
        })();
        result.unwrap_or_else(|e| HandlerOutcome::error(&e))
    }

    // === Inventory ===

    fn update_inventory(
        &self,
        session: &SharedSession,
        token: Uuid,
        products: Vec<crate::inventory::Product>,
        replace: bool,
    ) -> Result<Vec<Outbound>> {
        let mut guard = session.lock();
        let session = &mut *guard;
        session.require_vendor(token)?;

        if replace {
            session.inventory.replace(products)?;
        } else {
            session.inventory.append(products)?;
        }

        // Reconcile the cart against the new catalog: lines for products no
        // longer listed are dropped, oversized lines shrink.
        let mut shrinks = Vec::new();
        let carted: Vec<String> = session
            .cart
            .lines()
            .iter()
            .map(|l| l.product_id.clone())
            .collect();
        for product_id in carted {
            match session.inventory.stock(&product_id) {
                Ok(stock) => {
                    if let Some(shrink) = session.cart.reconcile_stock(&product_id, stock) {
                        shrinks.push(shrink);
                    }
                }
                Err(_) => session.cart.remove_item(&product_id),
            }
        }

        let products = session.inventory.views();
        let cart = cart_frame(session);
        drop(guard);

        let mut outbound = vec![Outbound::new(
            Target::Both,
            ServerEvent::InventoryUpdated { products },
        )];
        for shrink in shrinks {
            outbound.push(Outbound::new(
                Target::Customer,
                ServerEvent::StockShrunk(shrink),
            ));
        }
        outbound.push(Outbound::new(Target::Vendor, cart));
        Ok(outbound)
    }

    fn edit_price(
        &self,
        session: &SharedSession,
        token: Uuid,
        product_id: &str,
        price: Decimal,
    ) -> Result<Vec<Outbound>> {
        let mut guard = session.lock();
        guard.require_vendor(token)?;
        guard.inventory.edit_price(product_id, price)?;
        let products = guard.inventory.views();
        drop(guard);

        Ok(vec![Outbound::new(
            Target::Both,
            ServerEvent::InventoryUpdated { products },
        )])
    }

    fn edit_floor_price(
        &self,
        session: &SharedSession,
        token: Uuid,
        product_id: &str,
        floor_price: Decimal,
    ) -> Result<Vec<Outbound>> {
        let mut guard = session.lock();
        guard.require_vendor(token)?;
        guard.inventory.edit_floor_price(product_id, floor_price)?;
        let products = guard.inventory.views();
        drop(guard);

        // Floor prices are invisible on the wire; only the vendor gets an ack.
        Ok(vec![Outbound::new(
            Target::Vendor,
            ServerEvent::InventoryUpdated { products },
        )])
    }

    fn edit_stock(
        &self,
        session: &SharedSession,
        token: Uuid,
        product_id: &str,
        stock: Decimal,
    ) -> Result<Vec<Outbound>> {
        let mut guard = session.lock();
        let session_ref = &mut *guard;
        session_ref.require_vendor(token)?;
        let new_stock = session_ref.inventory.edit_stock(product_id, stock)?;
        let shrink = session_ref.cart.reconcile_stock(product_id, new_stock);
        let products = session_ref.inventory.views();
        let cart = cart_frame(session_ref);
        drop(guard);

        let mut outbound = vec![Outbound::new(
            Target::Both,
            ServerEvent::InventoryUpdated { products },
        )];
        if let Some(shrink) = shrink {
            outbound.push(Outbound::new(
                Target::Customer,
                ServerEvent::StockShrunk(shrink),
            ));
            outbound.push(Outbound::new(Target::Vendor, cart));
        }
        Ok(outbound)
    }

    fn get_products(&self, session: &SharedSession, token: Uuid) -> Result<Vec<Outbound>> {
        let guard = session.lock();
        guard.authorize(token)?;
        let products = guard.inventory.views();
        drop(guard);

        Ok(vec![Outbound::new(
            Target::Requester,
            ServerEvent::InventoryUpdated { products },
        )])
    }

    // === Cart ===

    /// Run a customer cart mutation, translating a stock rejection into the
    /// actionable rejection frame rather than a bare error.
    fn cart_mutation<F>(
        &self,
        session: &SharedSession,
        token: Uuid,
        mutate: F,
    ) -> Result<Vec<Outbound>>
    where
        F: FnOnce(&mut crate::session::Session) -> Result<()>,
    {
        let mut guard = session.lock();
        let session_ref = &mut *guard;
        session_ref.require_customer(token)?;

        match mutate(session_ref) {
            Ok(()) => {
                let cart = cart_frame(session_ref);
                drop(guard);
                // The customer holds optimistic local state; the reconciled
                // cart mirrors to the vendor side only.
                Ok(vec![Outbound::new(Target::Vendor, cart)])
            }
            Err(MarketError::StockExceeded {
                product_id,
                requested,
                available,
                in_cart,
            }) => {
                let err = MarketError::StockExceeded {
                    product_id: product_id.clone(),
                    requested,
                    available,
                    in_cart,
                };
                let message = err.to_string();
                drop(guard);
                Ok(vec![Outbound::new(
                    Target::Requester,
                    ServerEvent::CartRejected {
                        product_id,
                        requested,
                        available,
                        in_cart,
                        message,
                    },
                )])
            }
            Err(other) => Err(other),
        }
    }

    // === Negotiation ===

    async fn propose_price(
        &self,
        session: &SharedSession,
        token: Uuid,
        product_id: &str,
        offer: Decimal,
        round: u32,
    ) -> Result<Vec<Outbound>> {
        // Lock scope one: validate, mutate the record, classify.
        let (classification, product_name, customer_language, vendor_language) = {
            let mut guard = session.lock();
            let session_ref = &mut *guard;
            session_ref.require_customer(token)?;
            let classification =
                session_ref
                    .negotiations
                    .begin_offer(&session_ref.inventory, product_id, offer, round)?;
            let product_name = session_ref.inventory.get(product_id)?.name.clone();
            (
                classification,
                product_name,
                session_ref.language_of(Role::Customer),
                session_ref.language_of(Role::Vendor),
            )
        };

        match classification {
            OfferClassification::VendorApproval {
                proposed_price,
                floor_price,
                market_price,
                round,
            } => Ok(vec![
                Outbound::new(
                    Target::Vendor,
                    ServerEvent::ApprovalRequested {
                        product_id: product_id.to_string(),
                        proposed_price,
                        floor_price,
                        market_price,
                        round,
                    },
                ),
                Outbound::new(
                    Target::Requester,
                    ServerEvent::OfferForwarded {
                        product_id: product_id.to_string(),
                        round,
                    },
                ),
            ]),
            OfferClassification::BelowFloor {
                floor_price,
                market_price,
                round,
                suggested_min,
                suggested_max,
                limit_reached,
            } => {
                let req = NarrativeRequest {
                    product_name,
                    customer_offer: offer,
                    floor_price,
                    market_price,
                    suggested_min,
                    suggested_max,
                    round,
                    closing: limit_reached,
                    language: customer_language,
                };
                // No lock held while the oracles run.
                let narrative = self.services.narrator.narrate(&req).await;
                let vendor_narrative = self
                    .services
                    .relay
                    .translate_or_original(&narrative.text, customer_language, vendor_language)
                    .await;

                debug!(
                    product_id,
                    round,
                    from_fallback = narrative.from_fallback,
                    "Counter narrative ready"
                );
                Ok(vec![
                    Outbound::new(
                        Target::Requester,
                        ServerEvent::CounterOffer {
                            product_id: product_id.to_string(),
                            narrative: narrative.text,
                            suggested_min,
                            suggested_max,
                            round,
                            negotiation_over: limit_reached,
                        },
                    ),
                    Outbound::new(
                        Target::Vendor,
                        ServerEvent::NegotiationProgress(NegotiationUpdate {
                            product_id: product_id.to_string(),
                            status: if limit_reached {
                                crate::negotiation::NegotiationStatus::NegotiationLimitExceeded
                            } else {
                                crate::negotiation::NegotiationStatus::AiCounterOffer
                            },
                            round,
                            narrative: vendor_narrative,
                        }),
                    ),
                ])
            }
        }
    }

    async fn respond_negotiation(
        &self,
        session: &SharedSession,
        token: Uuid,
        product_id: &str,
        response: VendorResponse,
    ) -> Result<Vec<Outbound>> {
        // Lock scope one: resolve the record and apply cart effects.
        let (resolution, cart, languages) = {
            let mut guard = session.lock();
            let session_ref = &mut *guard;
            session_ref.require_vendor(token)?;
            let resolution = session_ref.negotiations.respond(product_id, &response)?;

            match resolution.status {
                crate::negotiation::NegotiationStatus::Accepted
                | crate::negotiation::NegotiationStatus::FinalOffer => {
                    if let Some(price) = resolution.final_price {
                        session_ref.cart.apply_agreed_price(
                            product_id,
                            price,
                            crate::cart::LineStatus::Accepted,
                        );
                    }
                }
                crate::negotiation::NegotiationStatus::Rejected => {
                    session_ref.cart.mark_rejected(product_id);
                }
                _ => {}
            }
            let cart = cart_frame(session_ref);
            let languages = (
                session_ref.language_of(Role::Vendor),
                session_ref.language_of(Role::Customer),
            );
            (resolution, cart, languages)
        };

        // Both parties learn the resolution (it carries the final price);
        // the cart mirror itself stays vendor-side.
        let mut outbound = vec![
            Outbound::new(
                Target::Both,
                ServerEvent::NegotiationResolved {
                    product_id: resolution.product_id.clone(),
                    status: resolution.status,
                    final_price: resolution.final_price,
                },
            ),
            Outbound::new(Target::Vendor, cart),
        ];

        // A custom message rides the relay to the customer, no lock held.
        if let VendorResponse::CustomMessage { text } = response {
            let (vendor_lang, customer_lang) = languages;
            let message = self
                .services
                .relay
                .relay(&text, Role::Vendor, vendor_lang, customer_lang)
                .await;
            session.lock().record_message(message.clone());
            outbound.push(Outbound::new(
                Target::Customer,
                ServerEvent::MessageReceived {
                    from: Role::Vendor,
                    text: message.rendered,
                    sentiment: message.sentiment,
                    language: customer_lang,
                },
            ));
        }
        Ok(outbound)
    }

    // === Settlement ===

    fn initiate_cash(&self, session: &SharedSession, token: Uuid) -> Result<Vec<Outbound>> {
        let mut guard = session.lock();
        let session_ref = &mut *guard;
        session_ref.require_customer(token)?;
        let pending = session_ref.settlements.initiate_cash(&session_ref.cart)?;
        let frame = ServerEvent::SettlementRequested {
            reference: pending.reference.clone(),
            method: pending.method,
            amount: pending.amount,
        };
        drop(guard);

        Ok(vec![Outbound::new(Target::Both, frame)])
    }

    fn confirm_settlement(
        &self,
        session: &SharedSession,
        token: Uuid,
        reference: &str,
        confirmer: Role,
    ) -> Result<Vec<Outbound>> {
        let mut guard = session.lock();
        let session_ref = &mut *guard;
        match confirmer {
            Role::Vendor => session_ref.require_vendor(token)?,
            Role::Customer => session_ref.require_customer(token)?,
        }
        let sale = session_ref.settlements.confirm(
            reference,
            &mut session_ref.cart,
            &mut session_ref.inventory,
        )?;
        let products = session_ref.inventory.views();
        drop(guard);

        Ok(vec![
            Outbound::new(Target::Both, ServerEvent::SaleCompleted(sale)),
            Outbound::new(Target::Both, ServerEvent::InventoryUpdated { products }),
        ])
    }

    fn reject_settlement(
        &self,
        session: &SharedSession,
        token: Uuid,
        reference: &str,
    ) -> Result<Vec<Outbound>> {
        let mut guard = session.lock();
        guard.require_vendor(token)?;
        let pending = guard.settlements.reject(reference)?;
        drop(guard);

        Ok(vec![Outbound::new(
            Target::Customer,
            ServerEvent::SettlementRejected {
                reference: pending.reference,
            },
        )])
    }

    async fn initiate_gateway(
        &self,
        session: &SharedSession,
        token: Uuid,
    ) -> Result<Vec<Outbound>> {
        // Lock scope one: validate and snapshot the amount.
        let (amount, reference) = {
            let guard = session.lock();
            guard.require_customer(token)?;
            if guard.cart.is_empty() {
                return Err(MarketError::EmptyCart);
            }
            (guard.cart.total(), format!("rcpt-{}", Uuid::new_v4()))
        };

        // Order creation happens with no lock held.
        let order = self
            .services
            .payments
            .create_order(amount, &reference)
            .await
            .map_err(|e| MarketError::External(e.to_string()))?;

        // Lock scope two: re-validate (the cart may have changed) and record.
        let mut guard = session.lock();
        let session_ref = &mut *guard;
        let pending = session_ref
            .settlements
            .initiate_gateway(&session_ref.cart, order.clone())?;
        let requested = ServerEvent::SettlementRequested {
            reference: pending.reference.clone(),
            method: pending.method,
            amount: pending.amount,
        };
        drop(guard);

        Ok(vec![
            Outbound::new(
                Target::Requester,
                ServerEvent::GatewayOrderCreated {
                    reference,
                    order_id: order.order_id,
                    amount,
                },
            ),
            Outbound::new(Target::Vendor, requested),
        ])
    }

    async fn confirm_gateway(
        &self,
        session: &SharedSession,
        token: Uuid,
        reference: &str,
        payment_id: &str,
        signature: &str,
    ) -> Result<Vec<Outbound>> {
        // Lock scope one: find the order to verify against.
        let order = {
            let guard = session.lock();
            guard.require_customer(token)?;
            guard
                .settlements
                .pending(reference)?
                .order
                .clone()
                .ok_or_else(|| MarketError::UnknownSettlement(reference.to_string()))?
        };

        // Signature check with no lock held.
        let verified = self
            .services
            .payments
            .verify(&order, payment_id, signature)
            .await
            .map_err(|e| MarketError::External(e.to_string()))?;
        if !verified {
            return Err(MarketError::VerificationFailed(reference.to_string()));
        }

        // Lock scope two: settle. The settled set rejects replays even if
        // two confirmations raced the verification step.
        self.confirm_settlement(session, token, reference, Role::Customer)
    }

    // === Chat ===

    async fn send_message(
        &self,
        session: &SharedSession,
        token: Uuid,
        text: &str,
    ) -> Result<Vec<Outbound>> {
        let (role, source, target) = {
            let guard = session.lock();
            let role = guard.authorize(token)?;
            (
                role,
                guard.language_of(role),
                guard.language_of(role.counterparty()),
            )
        };

        let message = self.services.relay.relay(text, role, source, target).await;
        session.lock().record_message(message.clone());

        let counterparty = match role.counterparty() {
            Role::Vendor => Target::Vendor,
            Role::Customer => Target::Customer,
        };
        Ok(vec![
            Outbound::new(
                counterparty,
                ServerEvent::MessageReceived {
                    from: role,
                    text: message.rendered.clone(),
                    sentiment: message.sentiment,
                    language: target,
                },
            ),
            Outbound::new(
                Target::Requester,
                ServerEvent::MessageSent {
                    original: message.original,
                    delivered: message.rendered,
                },
            ),
        ])
    }

    /// Tear down a connection's session participation. Called by the
    /// connection layer when a bound client drops.
    pub fn handle_disconnect(&self, binding: &ClientBinding) -> Vec<Outbound> {
        let Ok(session) = self.services.store.get(&binding.session) else {
            return Vec::new();
        };
        session.lock().mark_disconnected(binding.role);

        vec![Outbound::new(
            match binding.role.counterparty() {
                Role::Vendor => Target::Vendor,
                Role::Customer => Target::Customer,
            },
            ServerEvent::UserDisconnected { role: binding.role },
        )]
    }
}

/// Snapshot the cart into its broadcast frame.
fn cart_frame(session: &crate::session::Session) -> ServerEvent {
    ServerEvent::CartUpdated {
        lines: session.cart.lines().to_vec(),
        total: session.cart.total(),
    }
}

/// Build the service bundle from concrete oracle implementations.
pub fn core_services(
    store: crate::session::SharedSessionStore,
    pricing: Arc<dyn crate::oracle::PricingOracle>,
    narrative: Arc<dyn crate::oracle::NarrativeOracle>,
    transform: Arc<dyn crate::oracle::TransformOracle>,
    payments: Arc<dyn crate::oracle::PaymentGateway>,
) -> SharedCoreServices {
    Arc::new(super::CoreServices {
        store,
        pricing,
        narrator: crate::negotiation::Narrator::new(narrative),
        relay: crate::relay::MessageRelay::new(transform),
        payments,
    })
}
