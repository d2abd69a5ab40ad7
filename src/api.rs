//! Control-plane HTTP API: log history, the live WebSocket feed, root
//! certificate download and the app/mock stores.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, error, info, warn};

use crate::activity::{ActivityLog, Subscription};
use crate::ca::CertificateAuthority;
use crate::error::{Error, Result};
use crate::forward::{ProxyBody, collect_request, empty, full, text_response};
use crate::store::{AppStore, MockResponse, MockStore, MonitoredApp};

const CERT_CONTENT_TYPE: &str = "application/x-x509-ca-cert";
const CERT_DISPOSITION: &str = "attachment; filename=proxy-ca.pem";

const WELCOME_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>PacketPeek</title>
    <style>
        body { font-family: -apple-system, Helvetica, Arial, sans-serif; max-width: 720px; margin: 40px auto; padding: 0 20px; color: #333; }
        h1 { text-align: center; }
        .ok { color: #27ae60; text-align: center; font-weight: bold; }
        .links { text-align: center; margin-top: 32px; }
        .links a { display: inline-block; margin: 0 10px 16px; padding: 12px 24px; background: #3498db; color: #fff; border-radius: 24px; text-decoration: none; }
    </style>
</head>
<body>
    <h1>PacketPeek</h1>
    <p class="ok">You are connected to the proxy.</p>
    <p>Install and trust the root certificate on this device to inspect HTTPS traffic:</p>
    <div class="links">
        <a href="/cert/ios">Certificate for iOS Simulator</a>
        <a href="/cert/macos">Certificate for macOS</a>
    </div>
</body>
</html>
"#;

#[derive(Clone)]
pub struct ApiServer {
    activity: Arc<ActivityLog>,
    ca: Arc<CertificateAuthority>,
    apps: Arc<AppStore>,
    mocks: Arc<MockStore>,
}

impl ApiServer {
    pub fn new(
        activity: Arc<ActivityLog>,
        ca: Arc<CertificateAuthority>,
        apps: Arc<AppStore>,
        mocks: Arc<MockStore>,
    ) -> Self {
        ApiServer {
            activity,
            ca,
            apps,
            mocks,
        }
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "Control API listening");
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Error accepting API connection: {}", e);
                    continue;
                }
            };
            let api = self.clone();
            tokio::spawn(async move { api.serve_connection(stream, peer).await });
        }
    }

    async fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let api = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let api = api.clone();
            async move { Ok::<_, std::convert::Infallible>(api.route(req).await) }
        });
        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
        {
            debug!(peer = %peer, "API connection ended: {}", e);
        }
    }

    pub async fn route<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body + Send,
        B::Error: std::fmt::Display,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!(method = %method, path = %path, "API request");

        match path.as_str() {
            "/logs" => match method {
                Method::GET => json_response(StatusCode::OK, &self.activity.snapshot()),
                _ => method_not_allowed(),
            },
            "/ws" => match method {
                Method::GET => self.live_feed(req),
                _ => method_not_allowed(),
            },
            "/welcome" => {
                let mut response = Response::new(full(WELCOME_PAGE));
                response
                    .headers_mut()
                    .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
                response
            }
            "/cert" | "/cert/ios" | "/cert/macos" => self.root_certificate(),
            "/api/apps" => match method {
                Method::GET => json_response(StatusCode::OK, &self.apps.list()),
                Method::POST => match read_json::<_, MonitoredApp>(req).await {
                    Ok(app) => match self.apps.add(app) {
                        Ok(()) => Response::new(empty()),
                        Err(e) => error_response(e),
                    },
                    Err(response) => response,
                },
                _ => method_not_allowed(),
            },
            "/api/mocks" => match method {
                Method::GET => json_response(StatusCode::OK, &self.mocks.list()),
                Method::POST => match read_json::<_, MockResponse>(req).await {
                    Ok(mock) => match self.mocks.add(mock) {
                        Ok(stored) => json_response(StatusCode::OK, &stored),
                        Err(e) => error_response(e),
                    },
                    Err(response) => response,
                },
                _ => method_not_allowed(),
            },
            _ => {
                if let Some(bundle_id) = path.strip_prefix("/api/apps/") {
                    self.app_by_id(&method, bundle_id)
                } else if let Some(id) = path.strip_prefix("/api/mocks/") {
                    self.mock_by_id(&method, id)
                } else {
                    text_response(StatusCode::NOT_FOUND, "Not found")
                }
            }
        }
    }

    fn root_certificate(&self) -> Response<ProxyBody> {
        let mut response = Response::new(full(self.ca.cert_pem().to_string()));
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(CERT_CONTENT_TYPE));
        headers.insert(header::CONTENT_DISPOSITION, HeaderValue::from_static(CERT_DISPOSITION));
        response
    }

    fn app_by_id(&self, method: &Method, bundle_id: &str) -> Response<ProxyBody> {
        if bundle_id.is_empty() {
            return text_response(StatusCode::BAD_REQUEST, "Bundle ID required");
        }
        match *method {
            Method::GET => match self.apps.get(bundle_id) {
                Some(app) => json_response(StatusCode::OK, &app),
                None => text_response(StatusCode::NOT_FOUND, "App not found"),
            },
            Method::DELETE => match self.apps.remove(bundle_id) {
                Ok(_) => {
                    let mut response = Response::new(empty());
                    *response.status_mut() = StatusCode::NO_CONTENT;
                    response
                }
                Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            },
            _ => method_not_allowed(),
        }
    }

    /// `GET` is accepted as well as `DELETE` for older clients.
    fn mock_by_id(&self, method: &Method, id: &str) -> Response<ProxyBody> {
        if id.is_empty() {
            return text_response(StatusCode::BAD_REQUEST, "Missing ID");
        }
        match *method {
            Method::GET | Method::DELETE => match self.mocks.remove(id) {
                Ok(true) => Response::new(empty()),
                Ok(false) => text_response(StatusCode::NOT_FOUND, "Mock not found"),
                Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            },
            _ => method_not_allowed(),
        }
    }

    /// Complete the WebSocket handshake and stream every new record as a JSON
    /// text frame until the viewer goes away.
    fn live_feed<B>(&self, mut req: Request<B>) -> Response<ProxyBody> {
        let is_websocket = req
            .headers()
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        let Some(key) = req.headers().get(header::SEC_WEBSOCKET_KEY).filter(|_| is_websocket) else {
            return text_response(StatusCode::BAD_REQUEST, "Expected a WebSocket upgrade");
        };
        let accept = derive_accept_key(key.as_bytes());
        let Ok(accept) = HeaderValue::from_str(&accept) else {
            return text_response(StatusCode::BAD_REQUEST, "Invalid WebSocket key");
        };

        let on_upgrade = hyper::upgrade::on(&mut req);
        // Subscribe before answering so nothing recorded after the 101 is missed.
        let subscription = self.activity.subscribe();
        let activity = self.activity.clone();
        tokio::spawn(async move {
            let id = subscription.id;
            match on_upgrade.await {
                Ok(upgraded) => stream_records(upgraded, subscription).await,
                Err(e) => warn!("WebSocket upgrade failed: {}", e),
            }
            activity.unsubscribe(id);
            debug!(subscriber = id, "Live viewer disconnected");
        });

        let mut response = Response::new(empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let headers = response.headers_mut();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
        response
    }
}

async fn stream_records(upgraded: Upgraded, mut subscription: Subscription) {
    let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
    let (mut sink, mut incoming) = ws.split();
    loop {
        tokio::select! {
            record = subscription.receiver.recv() => {
                let Some(record) = record else { break };
                let json = match serde_json::to_string(&record) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode record: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json)).await {
                    debug!("Live viewer write failed: {}", e);
                    break;
                }
            }
            message = incoming.next() => match message {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("Live viewer read failed: {}", e);
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
    let _ = sink.close().await;
}

fn json_response<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(value) {
        Ok(json) => {
            let mut response = Response::new(full(json));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Rejected input is the caller's fault; anything else is ours.
fn error_response(error: Error) -> Response<ProxyBody> {
    let status = match error {
        Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    text_response(status, error.to_string())
}

fn method_not_allowed() -> Response<ProxyBody> {
    text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
}

async fn read_json<B, T>(req: Request<B>) -> std::result::Result<T, Response<ProxyBody>>
where
    B: Body + Send,
    B::Error: std::fmt::Display,
    T: DeserializeOwned,
{
    let (_, body): (_, Bytes) = collect_request(req).await;
    serde_json::from_slice(&body).map_err(|e| text_response(StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", e)))
}
