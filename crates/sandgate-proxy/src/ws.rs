//! WebSocket forwarding.
//!
//! The upstream socket is opened before the client upgrade is accepted,
//! so a dead backend is reported as a plain 502 instead of an upgrade
//! followed by an immediate close. Once both sides are open, data frames
//! are piped verbatim; control frames are handled per hop.
//!
//! Backend close frames are not trusted to be client-safe: anything but a
//! normal close becomes `1011` with a generic reason.

use axum::extract::FromRequestParts;
use axum::extract::Request;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use http::HeaderMap;
use http::header::{self, HeaderName};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError, SubProtocolError};
use tokio_tungstenite::tungstenite::handshake::client::Response as UpstreamResponse;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use sandgate_auth::TokenLocator;

use crate::error::ProxyError;
use crate::forward::{Upstream, path_and_query, prepare_upstream_headers};

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Sent in place of any abnormal backend close.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Sent when the backend connection is lost mid-session.
pub const CLOSE_BAD_GATEWAY: u16 = 1014;

const GENERIC_ERROR_REASON: &str = "backend error";
const UPSTREAM_LOST_REASON: &str = "upstream unavailable";

/// Handshake headers the upstream client generates itself.
const HANDSHAKE_HEADERS: [HeaderName; 5] = [
    header::HOST,
    header::SEC_WEBSOCKET_KEY,
    header::SEC_WEBSOCKET_VERSION,
    header::SEC_WEBSOCKET_EXTENSIONS,
    header::SEC_WEBSOCKET_ACCEPT,
];

/// Whether the request asks for a WebSocket upgrade.
pub(crate) fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
}

/// Connect upstream, then complete the client upgrade and pipe frames.
pub(crate) async fn forward_websocket(
    upstream: &Upstream,
    locator: &TokenLocator,
    req: Request,
) -> Result<Response, ProxyError> {
    let (mut parts, _body) = req.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let url = upstream.url("ws", path_and_query(&parts.uri));
    let mut headers = parts.headers;
    prepare_upstream_headers(&mut headers, locator);
    for name in &HANDSHAKE_HEADERS {
        headers.remove(name);
    }

    let (socket, response) = match connect_upstream(&url, &headers, true).await {
        // A backend may decline every offered subprotocol; browsers accept
        // that, the upstream client does not.
        Err(WsError::Protocol(ProtocolError::SecWebSocketSubProtocolError(
            SubProtocolError::NoSubProtocol,
        ))) => {
            debug!(%url, "backend declined the offered subprotocols, reconnecting without");
            connect_upstream(&url, &headers, false).await
        }
        other => other,
    }
    .map_err(|e| ProxyError::UpstreamUnavailable(e.to_string()))?;
    debug!(%url, "upstream websocket connected");

    let selected = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let upgrade = match selected {
        Some(protocol) => upgrade.protocols([protocol]),
        None => upgrade,
    };

    Ok(upgrade.on_upgrade(move |client| pipe(client, socket)))
}

async fn connect_upstream(
    url: &str,
    headers: &HeaderMap,
    with_protocol: bool,
) -> Result<(UpstreamSocket, UpstreamResponse), WsError> {
    let mut request = url.into_client_request()?;
    for (name, value) in headers {
        if !with_protocol && *name == header::SEC_WEBSOCKET_PROTOCOL {
            continue;
        }
        request.headers_mut().append(name.clone(), value.clone());
    }
    tokio_tungstenite::connect_async(request).await
}

/// Relay frames until either side closes.
async fn pipe(client: WebSocket, upstream: UpstreamSocket) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    loop {
        tokio::select! {
            msg = client_rx.next() => match msg {
                Some(Ok(Message::Close(frame))) => {
                    let frame = frame.map(|f| UpstreamCloseFrame {
                        code: CloseCode::from(f.code),
                        reason: f.reason.as_str().to_owned().into(),
                    });
                    let _ = upstream_tx.send(UpstreamMessage::Close(frame)).await;
                    break;
                }
                Some(Ok(msg)) => {
                    let Some(msg) = to_upstream(msg) else { continue };
                    if let Err(e) = upstream_tx.send(msg).await {
                        warn!(error = %e, "upstream websocket send failed");
                        let _ = client_tx.send(upstream_lost()).await;
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!(error = %e, "client websocket error");
                    let _ = upstream_tx.close().await;
                    break;
                }
                None => {
                    let _ = upstream_tx.close().await;
                    break;
                }
            },
            msg = upstream_rx.next() => match msg {
                Some(Ok(UpstreamMessage::Close(frame))) => {
                    let code = frame.as_ref().map(|f| u16::from(f.code));
                    let reason = frame.as_ref().map_or("", |f| f.reason.as_str());
                    let _ = client_tx.send(Message::Close(Some(client_close(code, reason)))).await;
                    break;
                }
                Some(Ok(msg)) => {
                    let Some(msg) = to_client(msg) else { continue };
                    if client_tx.send(msg).await.is_err() {
                        let _ = upstream_tx.close().await;
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "upstream websocket failed");
                    let _ = client_tx.send(upstream_lost()).await;
                    break;
                }
                None => {
                    warn!("upstream websocket ended without a close frame");
                    let _ = client_tx.send(upstream_lost()).await;
                    break;
                }
            },
        }
    }
    debug!("websocket session ended");
}

/// The close frame a client sees for a backend close.
///
/// Normal closes keep their code but lose the reason text; everything
/// else is collapsed to a generic internal error.
pub(crate) fn client_close(code: Option<u16>, reason: &str) -> CloseFrame {
    match code {
        None | Some(CLOSE_NORMAL) => CloseFrame {
            code: CLOSE_NORMAL,
            reason: Utf8Bytes::from_static(""),
        },
        Some(CLOSE_GOING_AWAY) => CloseFrame {
            code: CLOSE_GOING_AWAY,
            reason: Utf8Bytes::from_static(""),
        },
        Some(code) => {
            warn!(code, %reason, "backend closed websocket with an error");
            CloseFrame {
                code: CLOSE_INTERNAL_ERROR,
                reason: Utf8Bytes::from_static(GENERIC_ERROR_REASON),
            }
        }
    }
}

fn upstream_lost() -> Message {
    info!("closing client websocket after upstream loss");
    Message::Close(Some(CloseFrame {
        code: CLOSE_BAD_GATEWAY,
        reason: Utf8Bytes::from_static(UPSTREAM_LOST_REASON),
    }))
}

fn to_upstream(msg: Message) -> Option<UpstreamMessage> {
    match msg {
        Message::Text(text) => Some(UpstreamMessage::Text(text.as_str().to_owned().into())),
        Message::Binary(data) => Some(UpstreamMessage::Binary(data)),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
    }
}

fn to_client(msg: UpstreamMessage) -> Option<Message> {
    match msg {
        UpstreamMessage::Text(text) => Some(Message::Text(text.as_str().to_owned().into())),
        UpstreamMessage::Binary(data) => Some(Message::Binary(data)),
        UpstreamMessage::Ping(_)
        | UpstreamMessage::Pong(_)
        | UpstreamMessage::Close(_)
        | UpstreamMessage::Frame(_) => None,
    }
}
