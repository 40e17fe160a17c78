//! # WebSocket Voice Relay Handler
//!
//! Accepts client WebSocket connections on `/ws/voice` and proxies each one
//! to the upstream realtime voice service: one upstream connection per client
//! connection, opened when the client arrives and torn down when either side
//! goes away.
//!
//! ## Relay Protocol:
//! 1. **Upgrade**: the request must declare a WebSocket upgrade (case-
//!    insensitive header check) — anything else is rejected with 400
//! 2. **Credential guard**: without an upstream API key the upgrade is
//!    rejected with 500 before any upstream connection is attempted
//! 3. **Handshake**: on accept, the relay dials upstream and, once that
//!    handshake completes, sends the one-shot `session.update` configuration
//! 4. **Pass-through**: while both legs are open, every payload is forwarded
//!    verbatim; the relay inspects `type` fields only for logging/metrics
//! 5. **Teardown**: a close or error on either leg closes the other
//!
//! ## Actor Model:
//! Each client connection is an independent Actix actor. The upstream pump
//! task (see [`crate::relay::upstream`]) talks back to the actor through
//! typed messages, and the actor drives the pure state machine in
//! [`crate::relay::session`] to decide what every event means.

use crate::config::AppConfig;
use crate::error::AppError;
use crate::relay::envelope;
use crate::relay::session::{transition, Effect, Frame, RelayEvent, RelayState};
use crate::relay::upstream::{self, UpstreamSettings};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, ResponseError, Result as ActixResult};
use actix_web_actors::ws;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Upstream handshake completed; the session may go active.
#[derive(Message)]
#[rtype(result = "()")]
pub struct UpstreamReady;

/// A payload frame arrived on the upstream leg.
#[derive(Message)]
#[rtype(result = "()")]
pub struct UpstreamInbound(pub Frame);

/// The upstream leg closed cleanly (or its stream ended).
#[derive(Message)]
#[rtype(result = "()")]
pub struct UpstreamGone {
    pub reason: Option<String>,
}

/// The upstream leg failed: connect error, socket error, or send error.
#[derive(Message)]
#[rtype(result = "()")]
pub struct UpstreamFailed(pub String);

/// WebSocket actor for one relay session.
pub struct RelayWebSocket {
    /// Unique id for this session (logging/metrics correlation)
    session_id: String,

    /// Current lifecycle state, advanced only through [`transition`]
    state: RelayState,

    /// Sender half of the upstream pump's outbound channel. `None` until the
    /// upstream connect is started and again after teardown — dropping it is
    /// what closes the upstream leg.
    upstream_tx: Option<UnboundedSender<WsMessage>>,

    /// Shared application state (metrics)
    app_state: web::Data<AppState>,

    /// Configuration snapshot taken at accept time; the session config that
    /// goes upstream is frozen for the life of the session
    config: AppConfig,
}

impl RelayWebSocket {
    pub fn new(app_state: web::Data<AppState>) -> Self {
        let config = app_state.get_config();
        Self {
            session_id: Uuid::new_v4().to_string(),
            state: RelayState::Idle,
            upstream_tx: None,
            app_state,
            config,
        }
    }

    /// Feed one event through the state machine and execute its effects.
    fn apply(&mut self, event: RelayEvent, ctx: &mut ws::WebsocketContext<Self>) {
        let (next, effects) = transition(self.state, event);

        if next != self.state {
            debug!(
                session_id = %self.session_id,
                from = ?self.state,
                to = ?next,
                "Relay state transition"
            );
            self.state = next;
        }

        for effect in effects {
            self.run_effect(effect, ctx);
        }
    }

    fn run_effect(&mut self, effect: Effect, ctx: &mut ws::WebsocketContext<Self>) {
        match effect {
            Effect::ConnectUpstream => {
                let (tx, rx) = unbounded_channel();
                self.upstream_tx = Some(tx);

                let settings = UpstreamSettings {
                    connect_url: self.config.upstream.connect_url(),
                    api_key: self.config.upstream.api_key.clone(),
                };

                debug!(session_id = %self.session_id, "Dialing upstream realtime API");
                tokio::spawn(upstream::run(ctx.address(), settings, rx));
            }

            Effect::SendSessionConfig => {
                let envelope = envelope::session_update(&self.config.session);
                let sent = self
                    .upstream_tx
                    .as_ref()
                    .map(|tx| tx.send(WsMessage::Text(envelope)).is_ok())
                    .unwrap_or(false);

                if sent {
                    info!(session_id = %self.session_id, "Session configuration sent upstream");
                } else {
                    warn!(
                        session_id = %self.session_id,
                        "Upstream leg gone before session configuration could be sent"
                    );
                }
            }

            Effect::ForwardUpstream(frame) => {
                let message = match frame {
                    Frame::Text(text) => WsMessage::Text(text),
                    Frame::Binary(data) => WsMessage::Binary(data),
                };

                let sent = self
                    .upstream_tx
                    .as_ref()
                    .map(|tx| tx.send(message).is_ok())
                    .unwrap_or(false);

                if sent {
                    self.app_state.record_forward_upstream();
                } else {
                    // Pump already gone: the frame is discarded, teardown is
                    // driven separately by the pump's lifecycle signal.
                    debug!(session_id = %self.session_id, "Upstream send raced teardown, frame dropped");
                    self.app_state.record_dropped_message();
                }
            }

            Effect::ForwardDownstream(frame) => {
                match frame {
                    Frame::Text(text) => {
                        // Bookkeeping only — unknown types forward all the same.
                        if let Some(kind) = envelope::envelope_kind(&text) {
                            debug!(session_id = %self.session_id, kind = %kind, "Forwarding upstream envelope");
                        }
                        ctx.text(text);
                    }
                    Frame::Binary(data) => ctx.binary(data),
                }
                self.app_state.record_forward_downstream();
            }

            Effect::NotifyDownstreamError(reason) => {
                warn!(session_id = %self.session_id, reason = %reason, "Notifying client of relay error");
                ctx.text(envelope::error_envelope(&reason));
            }

            Effect::CloseUpstream => {
                // Dropping the sender ends the pump task, which answers with
                // a close frame on the upstream socket.
                debug!(session_id = %self.session_id, "Closing upstream leg");
                self.upstream_tx = None;
            }

            Effect::CloseDownstream => {
                debug!(session_id = %self.session_id, "Closing client leg");
                ctx.close(None);
                ctx.stop();
            }

            Effect::DropFrame => {
                debug!(
                    session_id = %self.session_id,
                    state = ?self.state,
                    "Dropping frame, opposite leg not open"
                );
                self.app_state.record_dropped_message();
            }
        }
    }
}

impl Actor for RelayWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "Client connected to relay");
        self.app_state.session_started();
        self.apply(RelayEvent::DownstreamConnected, ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Whatever path got us here (close, error, forced stop), make sure
        // the upstream leg follows and the session is accounted for.
        self.state = RelayState::Closed;
        self.upstream_tx = None;
        self.app_state.session_ended();
        info!(session_id = %self.session_id, "Relay session ended");
    }
}

/// Inbound traffic on the client leg.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelayWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.apply(
                    RelayEvent::DownstreamFrame(Frame::Text(text.to_string())),
                    ctx,
                );
            }
            Ok(ws::Message::Binary(data)) => {
                self.apply(
                    RelayEvent::DownstreamFrame(Frame::Binary(data.to_vec())),
                    ctx,
                );
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, ?reason, "Client closed connection");
                self.apply(RelayEvent::DownstreamClosed, ctx);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, "Client socket error: {}", err);
                self.apply(RelayEvent::DownstreamFailed(err.to_string()), ctx);
                ctx.stop();
            }
        }
    }
}

impl Handler<UpstreamReady> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, _msg: UpstreamReady, ctx: &mut Self::Context) {
        self.apply(RelayEvent::UpstreamConnected, ctx);
    }
}

impl Handler<UpstreamInbound> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, msg: UpstreamInbound, ctx: &mut Self::Context) {
        self.apply(RelayEvent::UpstreamFrame(msg.0), ctx);
    }
}

impl Handler<UpstreamGone> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, msg: UpstreamGone, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, reason = ?msg.reason, "Upstream leg gone");
        self.apply(RelayEvent::UpstreamClosed, ctx);
    }
}

impl Handler<UpstreamFailed> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, msg: UpstreamFailed, ctx: &mut Self::Context) {
        // Distinguish connect-phase failure from mid-call failure so the
        // state machine can pick the right effects; both end Closed.
        let event = if self.state == RelayState::AwaitingUpstream {
            RelayEvent::UpstreamConnectFailed(msg.0)
        } else {
            RelayEvent::UpstreamFailed(msg.0)
        };
        self.apply(event, ctx);
    }
}

/// Pre-upgrade guards for the relay endpoint.
///
/// ## Rejections:
/// - request without a `websocket` upgrade header (case-insensitive) → 400
/// - missing upstream credential → 500, and zero upstream connection attempts
///
/// Returns `None` when the handshake may proceed to the WebSocket upgrade.
fn handshake_rejection(upgrade_header: Option<&str>, credential_configured: bool) -> Option<HttpResponse> {
    let is_websocket = upgrade_header
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if !is_websocket {
        return Some(
            AppError::BadRequest("Expected WebSocket connection".to_string()).error_response(),
        );
    }

    if !credential_configured {
        return Some(
            AppError::ConfigurationMissing("upstream API key".to_string()).error_response(),
        );
    }

    None
}

/// Voice relay endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Runs the pre-upgrade guards, then hands the connection to a fresh
/// [`RelayWebSocket`] actor which owns both legs for the session's lifetime.
pub async fn voice_relay(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        "New voice relay request from: {:?}",
        req.connection_info().peer_addr()
    );

    let upgrade_header = req
        .headers()
        .get(actix_web::http::header::UPGRADE)
        .and_then(|value| value.to_str().ok());

    let credential_configured = app_state.get_config().credential_configured();

    if let Some(rejection) = handshake_rejection(upgrade_header, credential_configured) {
        warn!(
            status = rejection.status().as_u16(),
            "Voice relay handshake rejected"
        );
        return Ok(rejection);
    }

    ws::start(RelayWebSocket::new(app_state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_websocket_request_rejected_with_400() {
        for header in [None, Some("h2c"), Some("")] {
            let rejection = handshake_rejection(header, true).expect("must reject");
            assert_eq!(rejection.status(), actix_web::http::StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn test_upgrade_header_match_is_case_insensitive() {
        for header in ["websocket", "WebSocket", "WEBSOCKET"] {
            assert!(handshake_rejection(Some(header), true).is_none());
        }
    }

    /// Missing credential: every upgrade attempt gets a server error, before
    /// any upstream connection could be attempted.
    #[test]
    fn test_missing_credential_rejected_with_500() {
        let rejection = handshake_rejection(Some("websocket"), false).expect("must reject");
        assert_eq!(
            rejection.status(),
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    /// The upgrade check runs first: a bad handshake is the client's fault
    /// even when the server is also missing its credential.
    #[test]
    fn test_upgrade_check_precedes_credential_check() {
        let rejection = handshake_rejection(None, false).expect("must reject");
        assert_eq!(rejection.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }
}
