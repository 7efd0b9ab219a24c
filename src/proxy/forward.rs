use axum::{
    Router,
    body::{Body, to_bytes},
    extract::{
        FromRequestParts, Request, State,
        ws::{self, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use reqwest::redirect::Policy;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::{
    self, client::IntoClientRequest, protocol::frame::coding::CloseCode,
};
use tracing::{debug, info, warn};

use super::{ProxyError, ProxyRule, ProxyTable};

/// Request bodies are buffered before forwarding.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct ProxyState {
    pub table: ProxyTable,
    pub client: reqwest::Client,
}

impl ProxyState {
    pub fn new(table: ProxyTable) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder().redirect(Policy::none()).build()?;
        Ok(Self { table, client })
    }
}

pub fn create_proxy_router(state: Arc<ProxyState>) -> Router {
    Router::new().fallback(proxy_handler).with_state(state)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Generated per connection by the WebSocket client, never copied from the browser.
const WS_HANDSHAKE: [header::HeaderName; 3] = [
    header::SEC_WEBSOCKET_KEY,
    header::SEC_WEBSOCKET_VERSION,
    header::SEC_WEBSOCKET_EXTENSIONS,
];

/// Request headers as sent upstream: hop-by-hop removed, origin rewritten.
fn upstream_headers(rule: &ProxyRule, incoming: &HeaderMap) -> HeaderMap {
    let mut headers = incoming.clone();
    strip_hop_by_hop(&mut headers);
    if rule.change_origin {
        let authority = rule
            .target
            .split_once("://")
            .map_or(rule.target.as_str(), |(_, rest)| rest);
        if let Ok(host) = HeaderValue::from_str(authority) {
            headers.insert(header::HOST, host);
        }
        if headers.contains_key(header::ORIGIN) {
            if let Ok(origin) = HeaderValue::from_str(&rule.target) {
                headers.insert(header::ORIGIN, origin);
            }
        }
    }
    headers
}

async fn proxy_handler(State(state): State<Arc<ProxyState>>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let Some(rule) = state.table.match_path(&path) else {
        debug!(path = %path, "No proxy rule matched.");
        return (StatusCode::NOT_FOUND, format!("No proxy rule for {path}")).into_response();
    };

    if rule.ws && is_upgrade_request(request.headers()) {
        return bridge_websocket(rule, request).await;
    }

    match forward_http(&state.client, rule, request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(path = %path, target = %rule.target, error = %e, "Proxy request failed.");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

async fn forward_http(
    client: &reqwest::Client,
    rule: &ProxyRule,
    request: Request,
) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or(parts.uri.path(), |pq| pq.as_str());
    let url = rule.upstream_url(path_and_query);

    let body = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ProxyError::Io(std::io::Error::other(e)))?;

    debug!(method = %parts.method, url = %url, "Forwarding request.");
    let upstream = client
        .request(parts.method.clone(), &url)
        .headers(upstream_headers(rule, &parts.headers))
        .body(body)
        .send()
        .await?;

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

fn to_upstream_ws_url(rule: &ProxyRule, path_and_query: &str) -> String {
    let url = rule.upstream_url(path_and_query);
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url
    }
}

/// Upstream handshake request carrying the client's headers (cookies, auth,
/// subprotocols) on top of the handshake fields tungstenite generates.
fn upstream_ws_request(
    rule: &ProxyRule,
    url: &str,
    incoming: &HeaderMap,
) -> Result<tungstenite::handshake::client::Request, ProxyError> {
    let mut request = url.into_client_request()?;
    let mut headers = upstream_headers(rule, incoming);
    for name in &WS_HANDSHAKE {
        headers.remove(name);
    }
    let target = request.headers_mut();
    for name in headers.keys() {
        target.remove(name);
        for value in headers.get_all(name) {
            target.append(name.clone(), value.clone());
        }
    }
    Ok(request)
}

async fn bridge_websocket(rule: &ProxyRule, request: Request) -> Response {
    let (mut parts, _body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or(parts.uri.path(), |pq| pq.as_str())
        .to_string();

    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let url = to_upstream_ws_url(rule, &path_and_query);
    // Connect first so an unreachable backend surfaces as 502, not a dead socket.
    let connected = match upstream_ws_request(rule, &url, &parts.headers) {
        Ok(request) => tokio_tungstenite::connect_async(request).await.map_err(ProxyError::from),
        Err(e) => Err(e),
    };
    let (upstream, handshake) = match connected {
        Ok(connected) => connected,
        Err(e) => {
            warn!(url = %url, error = %e, "Upstream WebSocket connect failed.");
            return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
        }
    };

    let protocol = handshake
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let upgrade = match protocol {
        Some(protocol) => upgrade.protocols([protocol]),
        None => upgrade,
    };

    info!(url = %url, "Bridging WebSocket session.");
    upgrade.on_upgrade(move |client| pump(client, upstream))
}

fn to_upstream(msg: ws::Message) -> tungstenite::Message {
    match msg {
        ws::Message::Text(t) => tungstenite::Message::text(t.as_str().to_string()),
        ws::Message::Binary(b) => tungstenite::Message::Binary(b),
        ws::Message::Ping(p) => tungstenite::Message::Ping(p),
        ws::Message::Pong(p) => tungstenite::Message::Pong(p),
        ws::Message::Close(frame) => tungstenite::Message::Close(frame.map(|f| {
            tungstenite::protocol::CloseFrame {
                code: CloseCode::from(f.code),
                reason: f.reason.as_str().to_string().into(),
            }
        })),
    }
}

/// `None` for raw frames, which are never surfaced by a reading socket.
fn to_client(msg: tungstenite::Message) -> Option<ws::Message> {
    Some(match msg {
        tungstenite::Message::Text(t) => ws::Message::Text(t.as_str().to_string().into()),
        tungstenite::Message::Binary(b) => ws::Message::Binary(b),
        tungstenite::Message::Ping(p) => ws::Message::Ping(p),
        tungstenite::Message::Pong(p) => ws::Message::Pong(p),
        tungstenite::Message::Close(frame) => ws::Message::Close(frame.map(|f| ws::CloseFrame {
            code: f.code.into(),
            reason: f.reason.as_str().to_string().into(),
        })),
        tungstenite::Message::Frame(_) => return None,
    })
}

async fn pump<S>(client: WebSocket, upstream: tokio_tungstenite::WebSocketStream<S>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let closing = matches!(msg, ws::Message::Close(_));
            if upstream_tx.send(to_upstream(msg)).await.is_err() || closing {
                break;
            }
        }
    };

    let upstream_to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let Some(msg) = to_client(msg) else { continue };
            let closing = matches!(msg, ws::Message::Close(_));
            if client_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    };

    tokio::select! {
        _ = client_to_upstream => debug!("Client side of the bridge closed."),
        _ = upstream_to_client => debug!("Upstream side of the bridge closed."),
    }
}
