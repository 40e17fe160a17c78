//! # Upstream Connector
//!
//! Opens the relay's outbound leg to the realtime voice service and pumps it
//! in both directions. One pump task per relay session; the task ends when
//! either the upstream socket goes away or the session actor drops its
//! sender (which this task answers with a clean upstream close).
//!
//! The pump never interprets payloads — it hands every inbound frame to the
//! session actor and writes every outbound frame verbatim. Lifecycle signals
//! (`UpstreamReady`, `UpstreamGone`, `UpstreamFailed`) are how the actor's
//! state machine learns what happened on this leg.

use crate::error::{AppError, AppResult};
use crate::relay::session::Frame;
use crate::websocket::{RelayWebSocket, UpstreamFailed, UpstreamGone, UpstreamInbound, UpstreamReady};
use actix::Addr;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, info, warn};

/// Everything the pump needs to reach the upstream service.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// Full connect URL including the model query parameter
    pub connect_url: String,
    /// Bearer credential for the upstream handshake
    pub api_key: String,
}

/// Build the upstream handshake request with the auth headers attached.
fn build_request(settings: &UpstreamSettings) -> AppResult<Request> {
    let mut request = settings.connect_url.as_str().into_client_request()?;

    let auth = HeaderValue::from_str(&format!("Bearer {}", settings.api_key))
        .map_err(|e| AppError::UpstreamUnavailable(format!("invalid credential: {}", e)))?;
    request.headers_mut().insert(AUTHORIZATION, auth);
    request
        .headers_mut()
        .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

    Ok(request)
}

/// Connect the upstream leg and pump it until either side is done.
///
/// ## Outcomes delivered to the session actor:
/// - `UpstreamReady` once the handshake completes
/// - `UpstreamInbound` for every payload frame received
/// - `UpstreamGone` on a clean upstream close (or end of stream)
/// - `UpstreamFailed` on a connect or socket error
///
/// When `outbound` yields `None` the session actor has dropped its sender
/// (downstream closed); the pump sends a close frame upstream and exits —
/// this is the teardown cascade for the client-hangs-up direction.
pub async fn run(
    addr: Addr<RelayWebSocket>,
    settings: UpstreamSettings,
    mut outbound: UnboundedReceiver<WsMessage>,
) {
    let request = match build_request(&settings) {
        Ok(request) => request,
        Err(e) => {
            addr.do_send(UpstreamFailed(e.to_string()));
            return;
        }
    };

    let stream = match connect_async(request).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            warn!("Upstream connect failed: {}", e);
            addr.do_send(UpstreamFailed(format!("upstream connect failed: {}", e)));
            return;
        }
    };

    info!("Connected to upstream realtime API");
    let (mut sink, mut reader) = stream.split();
    addr.do_send(UpstreamReady);

    loop {
        tokio::select! {
            inbound = reader.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    addr.do_send(UpstreamInbound(Frame::Text(text)));
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    addr.do_send(UpstreamInbound(Frame::Binary(data)));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    info!("Upstream connection closed");
                    addr.do_send(UpstreamGone {
                        reason: frame.map(|f| f.reason.to_string()),
                    });
                    break;
                }
                // Ping/pong is answered by the protocol layer
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Upstream socket error: {}", e);
                    addr.do_send(UpstreamFailed(format!("upstream socket error: {}", e)));
                    break;
                }
                None => {
                    info!("Upstream stream ended");
                    addr.do_send(UpstreamGone { reason: None });
                    break;
                }
            },
            out = outbound.recv() => match out {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        warn!("Upstream send failed: {}", e);
                        addr.do_send(UpstreamFailed(format!("upstream send failed: {}", e)));
                        break;
                    }
                }
                None => {
                    // Session actor dropped its sender: downstream is gone,
                    // so close this leg cleanly and stop pumping.
                    debug!("Session ended, closing upstream leg");
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_sets_auth_headers() {
        let settings = UpstreamSettings {
            connect_url: "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview-2024-10-01"
                .to_string(),
            api_key: "sk-test".to_string(),
        };

        let request = build_request(&settings).unwrap();
        assert_eq!(
            request.headers().get(AUTHORIZATION).unwrap(),
            "Bearer sk-test"
        );
        assert_eq!(
            request.headers().get("OpenAI-Beta").unwrap(),
            "realtime=v1"
        );
        assert_eq!(request.uri().host(), Some("api.openai.com"));
    }

    #[test]
    fn test_build_request_rejects_bad_credential() {
        let settings = UpstreamSettings {
            connect_url: "wss://api.openai.com/v1/realtime".to_string(),
            api_key: "bad\nkey".to_string(),
        };
        assert!(build_request(&settings).is_err());
    }
}
