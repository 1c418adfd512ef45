//! The WebSocket server loop.
//!
//! Each accepted socket gets three tasks: a read task (this function's own
//! loop), a writer task draining the session's outbound queue, and a
//! keep-alive task. EVENT, REQ and COUNT envelopes are handled on spawned
//! tasks so a privileged request waiting for authentication never blocks
//! the read loop that would deliver the AUTH response.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_proto::{validate_auth_event, ClientEnvelope, Event, RelayEnvelope};

use crate::access::AccessGate;
use crate::acl::AccessList;
use crate::config::RelayConfig;
use crate::error::{EngineError, Rejection};
use crate::hooks::Hooks;
use crate::ingest;
use crate::query;
use crate::registry::Registry;
use crate::session::{unix_now, Outbound, Session};
use crate::storage::EventStore;

/// The relay: configuration, ACL, registry, hooks and storage backends.
/// Shared as `Arc<Relay>` by every connection and request task.
pub struct Relay {
    pub config: Arc<RelayConfig>,
    pub acl: Arc<AccessList>,
    pub registry: Registry,
    pub hooks: Hooks,
    pub stores: Vec<Arc<dyn EventStore>>,
    /// Root token; canceling it shuts the whole relay down.
    pub shutdown: CancellationToken,
    gate: AccessGate,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let config = Arc::new(config);
        let acl = Arc::new(AccessList::new());
        acl.seed_owners(config.owners.iter().cloned(), unix_now());
        let gate = AccessGate::new(config.clone(), acl.clone());
        Relay {
            config,
            acl,
            registry: Registry::new(),
            hooks: Hooks::default(),
            stores: Vec::new(),
            shutdown: CancellationToken::new(),
            gate,
        }
    }

    /// Attach a storage backend. Order matters: queries hit backends in
    /// attachment order.
    pub fn with_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.stores.push(store);
        self
    }

    pub fn gate(&self) -> &AccessGate {
        &self.gate
    }

    /// Request a graceful shutdown; cascades to every connection.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Accept connections until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<(), EngineError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!(addr = %self.config.bind_addr, url = %self.config.relay_url, "relay listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("relay shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    tokio::spawn(self.clone().handle_connection(stream, addr));
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(self.config.max_message_size))
            .max_frame_size(Some(self.config.max_message_size));
        let ws = match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await
        {
            Ok(ws) => ws,
            Err(e) => {
                debug!(remote = %addr, error = %e, "websocket handshake failed");
                return;
            }
        };
        let (mut write, mut read) = ws.split();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = self.shutdown.child_token();
        let session = Arc::new(Session::new(addr, tx, token.clone()));
        self.registry.register(session.clone());
        for hook in &self.hooks.connection {
            hook.on_connect(&session);
        }
        info!(conn = %session.id, remote = %addr, "connection open");

        if self.gate.auth_mandatory() {
            session.issue_challenge();
        }

        // single writer: producers enqueue, this task alone touches the sink
        let writer = {
            let token = token.clone();
            let write_timeout = self.config.write_timeout;
            tokio::spawn(async move {
                loop {
                    let item = tokio::select! {
                        _ = token.cancelled() => break,
                        item = rx.recv() => match item {
                            Some(item) => item,
                            None => break,
                        },
                    };
                    let message = match item {
                        Outbound::Envelope(envelope) => Message::Text(envelope.to_json().into()),
                        Outbound::Ping => Message::Ping(Bytes::new()),
                        Outbound::Pong(data) => Message::Pong(data.into()),
                    };
                    match timeout(write_timeout, write.send(message)).await {
                        Ok(Ok(())) => {}
                        _ => {
                            token.cancel();
                            break;
                        }
                    }
                }
                let _ = write.close().await;
            })
        };

        {
            let session = session.clone();
            let token = token.clone();
            let interval = self.config.ping_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if !session.send_raw(Outbound::Ping) {
                                break;
                            }
                        }
                    }
                }
            });
        }

        // read loop; any inbound frame refreshes the deadline
        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break,
                frame = timeout(self.config.pong_timeout, read.next()) => frame,
            };
            let frame = match frame {
                Err(_) => {
                    debug!(conn = %session.id, "read deadline expired");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(conn = %session.id, error = %e, "read failed");
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };
            match frame {
                Message::Text(text) => self.dispatch(&session, text.as_str()),
                Message::Binary(_) => {
                    session.record_offense();
                }
                Message::Ping(data) => {
                    session.send_raw(Outbound::Pong(data.to_vec()));
                }
                Message::Pong(_) => {}
                Message::Close(_) => break,
                Message::Frame(_) => {}
            }
        }

        token.cancel();
        for hook in &self.hooks.connection {
            hook.on_disconnect(&session);
        }
        self.registry.unregister(session.id);
        let _ = writer.await;
        info!(conn = %session.id, remote = %addr, "connection closed");
    }

    fn dispatch(self: &Arc<Self>, session: &Arc<Session>, text: &str) {
        if session.muted(self.config.max_offenses) {
            return;
        }
        let envelope = match ClientEnvelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                if e.is_malformed() {
                    session.record_offense();
                }
                session.send(RelayEnvelope::Notice {
                    message: e.to_string(),
                });
                return;
            }
        };
        match envelope {
            ClientEnvelope::Event(event) => {
                tokio::spawn(ingest::handle_event(
                    self.clone(),
                    session.clone(),
                    event,
                ));
            }
            ClientEnvelope::Req { sub_id, filters } => {
                tokio::spawn(query::handle_req(
                    self.clone(),
                    session.clone(),
                    sub_id,
                    filters,
                ));
            }
            ClientEnvelope::Close { sub_id } => {
                self.registry.remove_subscription(session.id, &sub_id);
            }
            ClientEnvelope::Auth(event) => self.handle_auth(session, event),
            ClientEnvelope::Count { sub_id, filters } => {
                tokio::spawn(query::handle_count(
                    self.clone(),
                    session.clone(),
                    sub_id,
                    filters,
                ));
            }
        }
    }

    /// Validate an AUTH response against the outstanding challenge.
    pub fn handle_auth(&self, session: &Session, event: Event) {
        let event_id = event.id.clone();
        match validate_auth_event(
            &event,
            &session.challenge(),
            &self.config.relay_url,
            unix_now(),
        ) {
            Ok(pubkey) => {
                if session.set_authenticated(&pubkey) {
                    info!(conn = %session.id, %pubkey, "session authenticated");
                    session.send(RelayEnvelope::Ok {
                        event_id,
                        accepted: true,
                        reason: String::new(),
                    });
                } else {
                    session.send(RelayEnvelope::Ok {
                        event_id,
                        accepted: false,
                        reason: Rejection::invalid(
                            "session is already authenticated as a different key",
                        )
                        .reason,
                    });
                }
            }
            Err(e) => {
                warn!(conn = %session.id, error = %e, "auth response rejected");
                session.send(RelayEnvelope::Ok {
                    event_id,
                    accepted: false,
                    reason: Rejection::invalid(&e.to_string()).reason,
                });
            }
        }
    }
}
