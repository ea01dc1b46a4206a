use metrics::{counter, gauge};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::channel::{close_code, ChannelError, Frame, FrameSource, PeerHandle, Termination};
use crate::envelope::{Envelope, EnvelopeError, Signal};
use crate::registry::ClientRegistry;

pub const REGISTRATION_REQUIRED: &str = "Registration required";
const SERVER_CLOSING: &str = "Connection closed by server";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unregistered,
    Registered(String),
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("client disconnected before registering: {0}")]
    Disconnected(ChannelError),
    #[error("expected text frame for registration, got {0}")]
    NonText(&'static str),
    #[error("registration frame is not an envelope: {0}")]
    Malformed(EnvelopeError),
    #[error("expected 'register' message type, got '{0}'")]
    UnexpectedType(String),
    #[error("error decoding register payload: {0}")]
    InvalidPayload(EnvelopeError),
    #[error("userId cannot be empty in register payload")]
    EmptyIdentity,
}

impl HandshakeError {
    fn metric_label(&self) -> &'static str {
        match self {
            HandshakeError::Disconnected(_) => "disconnected",
            HandshakeError::NonText(_) => "non_text",
            HandshakeError::Malformed(_) => "malformed",
            HandshakeError::UnexpectedType(_) => "unexpected_type",
            HandshakeError::InvalidPayload(_) => "invalid_payload",
            HandshakeError::EmptyIdentity => "empty_identity",
        }
    }

    /// Whether the client sent something that must be answered with a policy close.
    fn is_violation(&self) -> bool {
        !matches!(self, HandshakeError::Disconnected(_))
    }
}

#[derive(Debug)]
pub enum SessionOutcome {
    /// The channel failed before the first frame arrived.
    Abandoned,
    Rejected(HandshakeError),
    Ended {
        user_id: String,
        termination: Termination,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The target is registered but its channel refused the frame.
    TargetUnreachable,
    /// The target is not registered; `reported` tells whether the sender got an error envelope.
    TargetMissing { reported: bool },
}

/// One accepted channel, from handshake to teardown.
pub struct ConnectionSession<S> {
    registry: ClientRegistry,
    handle: PeerHandle,
    source: S,
    state: SessionState,
}

impl<S: FrameSource> ConnectionSession<S> {
    pub fn new(registry: ClientRegistry, handle: PeerHandle, source: S) -> Self {
        Self {
            registry,
            handle,
            source,
            state: SessionState::Unregistered,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub async fn run(mut self) -> SessionOutcome {
        counter!("beach_beacon_connections_total", 1);

        let user_id = match self.handshake().await {
            Ok(user_id) => user_id,
            Err(err) => return self.reject(err).await,
        };

        let termination = self.dispatch_loop(&user_id).await;
        self.teardown(&user_id).await;

        SessionOutcome::Ended {
            user_id,
            termination,
        }
    }

    async fn handshake(&mut self) -> Result<String, HandshakeError> {
        let frame = self
            .source
            .recv()
            .await
            .map_err(HandshakeError::Disconnected)?;
        let text = match frame {
            Frame::Text(text) => text,
            other => return Err(HandshakeError::NonText(other.kind())),
        };

        let envelope = Envelope::parse(&text).map_err(HandshakeError::Malformed)?;
        if !envelope.is_register() {
            return Err(HandshakeError::UnexpectedType(envelope.kind));
        }
        let payload = envelope
            .register_payload()
            .map_err(HandshakeError::InvalidPayload)?;
        if payload.user_id.is_empty() {
            return Err(HandshakeError::EmptyIdentity);
        }

        if self.registry.upsert(&payload.user_id, self.handle.clone()) {
            warn!(
                user_id = %payload.user_id,
                connection_id = %self.handle.connection_id(),
                "identity already connected; overwriting previous registration"
            );
        }
        gauge!("beach_beacon_registered_clients", self.registry.len() as f64);
        counter!("beach_beacon_handshakes_success_total", 1);
        info!(
            user_id = %payload.user_id,
            connection_id = %self.handle.connection_id(),
            "client registered"
        );

        self.state = SessionState::Registered(payload.user_id.clone());
        Ok(payload.user_id)
    }

    async fn reject(mut self, err: HandshakeError) -> SessionOutcome {
        counter!(
            "beach_beacon_handshakes_failure_total",
            1,
            "reason" => err.metric_label()
        );

        if !err.is_violation() {
            info!(
                connection_id = %self.handle.connection_id(),
                error = %err,
                "unregistered client disconnected"
            );
            self.close_channel().await;
            return SessionOutcome::Abandoned;
        }

        warn!(
            connection_id = %self.handle.connection_id(),
            error = %err,
            "failed to register client"
        );
        if let Err(close_err) = self
            .handle
            .close(close_code::POLICY, REGISTRATION_REQUIRED)
            .await
        {
            debug!(
                connection_id = %self.handle.connection_id(),
                error = %close_err,
                "error sending policy close"
            );
        }
        SessionOutcome::Rejected(err)
    }

    async fn dispatch_loop(&mut self, user_id: &str) -> Termination {
        loop {
            let frame = match self.source.recv().await {
                Ok(frame) => frame,
                Err(err) => {
                    let termination = Termination::classify(&err);
                    match termination {
                        Termination::Normal => {
                            info!(user_id = %user_id, "client closed connection normally")
                        }
                        Termination::Cancelled => {
                            info!(user_id = %user_id, error = %err, "connection cancelled")
                        }
                        Termination::Abnormal => {
                            warn!(user_id = %user_id, error = %err, "error reading message")
                        }
                    }
                    return termination;
                }
            };

            match frame {
                Frame::Text(text) => self.dispatch(user_id, &text).await,
                Frame::Binary(data) => {
                    debug!(
                        user_id = %user_id,
                        bytes = data.len(),
                        "ignoring non-text frame"
                    );
                    record_discard("non_text");
                }
            }
        }
    }

    async fn dispatch(&mut self, user_id: &str, text: &str) {
        debug!(user_id = %user_id, message = %text, "received message");

        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope.stamped(user_id),
            Err(err) => {
                debug!(user_id = %user_id, error = %err, "discarding malformed envelope");
                record_discard("malformed");
                return;
            }
        };

        let signal = match envelope.signal() {
            Ok(signal) => signal,
            Err(_) if envelope.is_register() => {
                ignore_repeat_register(user_id);
                return;
            }
            Err(err) => {
                debug!(
                    user_id = %user_id,
                    kind = %envelope.kind,
                    error = %err,
                    "discarding envelope without usable payload"
                );
                record_discard("payload");
                return;
            }
        };

        match signal {
            Signal::Forward {
                kind,
                target_user_id,
            } => {
                let serialized = match envelope.to_json() {
                    Ok(serialized) => serialized,
                    Err(err) => {
                        warn!(user_id = %user_id, error = %err, "error re-encoding envelope");
                        return;
                    }
                };
                debug!(
                    kind = kind.as_str(),
                    from = %user_id,
                    to = %target_user_id,
                    "forwarding"
                );
                counter!(
                    "beach_beacon_envelopes_forwarded_total",
                    1,
                    "type" => kind.as_str()
                );
                deliver(&self.registry, &target_user_id, user_id, serialized).await;
            }
            Signal::Register { .. } => ignore_repeat_register(user_id),
            Signal::Error => {
                debug!(user_id = %user_id, "ignoring client-sent error envelope")
            }
            Signal::Unknown(kind) => {
                debug!(user_id = %user_id, kind = %kind, "unhandled message type")
            }
        }
    }

    async fn teardown(&mut self, user_id: &str) {
        if self.registry.remove_if_current(user_id, &self.handle) {
            gauge!("beach_beacon_registered_clients", self.registry.len() as f64);
            info!(user_id = %user_id, "client disconnected");
        } else {
            info!(
                user_id = %user_id,
                "client disconnected; identity no longer bound to this connection"
            );
        }
        self.close_channel().await;
    }

    async fn close_channel(&mut self) {
        if let Err(err) = self.handle.close(close_code::NORMAL, SERVER_CLOSING).await {
            debug!(
                connection_id = %self.handle.connection_id(),
                error = %err,
                "error closing websocket connection"
            );
        }
    }
}

/// Routes a serialized envelope to `target`, reporting a missing target back to `sender`.
///
/// A target whose channel rejects the frame is evicted (only if the registry still points
/// at that same connection); the sender is not told about it.
pub async fn deliver(
    registry: &ClientRegistry,
    target: &str,
    sender: &str,
    serialized: String,
) -> DeliveryOutcome {
    let Some(peer) = registry.lookup(target) else {
        info!(target_user = %target, sender = %sender, "target not found");
        counter!("beach_beacon_routing_failures_total", 1);
        let reported = report_not_found(registry, sender, target).await;
        return DeliveryOutcome::TargetMissing { reported };
    };

    match peer.send_text(serialized).await {
        Ok(()) => {
            debug!(target_user = %target, "sent message");
            DeliveryOutcome::Delivered
        }
        Err(err) => {
            warn!(
                target_user = %target,
                connection_id = %peer.connection_id(),
                error = %err,
                "error sending message"
            );
            counter!("beach_beacon_delivery_failures_total", 1);
            if registry.remove_if_current(target, &peer) {
                counter!("beach_beacon_stale_entries_evicted_total", 1);
                gauge!("beach_beacon_registered_clients", registry.len() as f64);
                info!(target_user = %target, "evicted unreachable client");
            }
            DeliveryOutcome::TargetUnreachable
        }
    }
}

async fn report_not_found(registry: &ClientRegistry, recipient: &str, missing: &str) -> bool {
    let text = match Envelope::not_found(missing).and_then(|envelope| envelope.to_json()) {
        Ok(text) => text,
        Err(err) => {
            warn!(recipient = %recipient, error = %err, "error encoding error envelope");
            return false;
        }
    };

    let Some(peer) = registry.lookup(recipient) else {
        info!(
            recipient = %recipient,
            "could not report failure; sender no longer connected"
        );
        return false;
    };

    match peer.send_text(text).await {
        Ok(()) => {
            debug!(recipient = %recipient, target_user = %missing, "sent not-found error");
            true
        }
        Err(err) => {
            warn!(recipient = %recipient, error = %err, "error sending error envelope");
            false
        }
    }
}

fn ignore_repeat_register(user_id: &str) {
    warn!(
        user_id = %user_id,
        "received 'register' again from already registered client"
    );
}

fn record_discard(reason: &'static str) {
    counter!("beach_beacon_envelopes_discarded_total", 1, "reason" => reason);
}
