//! Outbound leg: sends captured requests to the real origin and relays the
//! response downstream while filling in the log record.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, stream};
use http::header::{self, HeaderName};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body, Frame, SizeHint};
use tracing::{debug, warn};

use crate::activity::ActivityLog;
use crate::client_profile::ClientProfile;
use crate::error::{Error, Result};
use crate::record::{RequestLog, flatten_headers, loggable_body};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed_unsync()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

pub fn text_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    let mut response = Response::new(full(message.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Connection-scoped headers that must not cross the proxy.
const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("proxy-connection"),
    HeaderName::from_static("keep-alive"),
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::PROXY_AUTHORIZATION,
    header::PROXY_AUTHENTICATE,
];

pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !HOP_BY_HOP.contains(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// HTTP client for the origin leg. Certificates are not verified: the proxy
/// deliberately does not re-validate the origin's identity.
pub fn upstream_client() -> Result<reqwest::Client> {
    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| Error::tls(format!("Failed to build upstream TLS connector: {}", e)))?;

    let client = reqwest::Client::builder()
        .use_preconfigured_tls(tls)
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .no_gzip()
        .build()?;
    Ok(client)
}

/// Buffer a request body. An unreadable body is treated as empty.
pub async fn collect_request<B>(req: Request<B>) -> (http::request::Parts, Bytes)
where
    B: Body + Send,
    B::Error: std::fmt::Display,
{
    let (parts, body) = req.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("Failed to read request body: {}", e);
            Bytes::new()
        }
    };
    (parts, bytes)
}

#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    activity: Arc<ActivityLog>,
}

impl Forwarder {
    pub fn new(activity: Arc<ActivityLog>) -> Result<Self> {
        Ok(Self::with_client(upstream_client()?, activity))
    }

    pub fn with_client(client: reqwest::Client, activity: Arc<ActivityLog>) -> Self {
        Forwarder { client, activity }
    }

    pub fn activity(&self) -> &Arc<ActivityLog> {
        &self.activity
    }

    /// Plain-HTTP proxy path: the request line must carry the absolute URL.
    /// An origin-form request names no origin and is answered with a 502
    /// rather than guessed from `Host`, which may well be this proxy.
    pub async fn forward_plain<B>(&self, req: Request<B>, client_addr: SocketAddr) -> Response<ProxyBody>
    where
        B: Body + Send,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = collect_request(req).await;
        let profile = ClientProfile::from_headers(&parts.headers);

        let mut entry = RequestLog::begin(parts.method.as_str(), parts.uri.to_string(), format!("{:?}", parts.version));
        entry.client_ip = client_addr.to_string();
        entry.request_headers = flatten_headers(&parts.headers);
        entry.request_body = loggable_body(&parts.headers, &body);
        entry.user_agent = profile.user_agent.clone();
        entry.apply_profile(&profile);

        let Some(url) = absolute_url(&parts.uri) else {
            debug!(uri = %parts.uri, client = %client_addr, "Refusing request without an absolute URL");
            entry.status_code = StatusCode::BAD_GATEWAY.as_u16();
            entry.finish();
            self.activity.record(entry);
            return text_response(StatusCode::BAD_GATEWAY, "no Host in request URL");
        };

        debug!(method = %parts.method, url = %url, client = %client_addr, "Forwarding plain request");
        self.exchange(parts.method, &url, &parts.headers, body, entry).await
    }

    /// Send one request to the origin and build the downstream response. The
    /// record is finished and stored once the response body has been relayed.
    /// Failures become a 502 for this request only.
    pub async fn exchange(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
        body: Bytes,
        mut entry: RequestLog,
    ) -> Response<ProxyBody> {
        let upstream = match self.send(method, url, headers, body).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(url, "Upstream request failed: {}", e);
                entry.status_code = StatusCode::BAD_GATEWAY.as_u16();
                entry.finish();
                self.activity.record(entry);
                return text_response(StatusCode::BAD_GATEWAY, e.to_string());
            }
        };

        let status = upstream.status();
        let upstream_headers = upstream.headers().clone();
        entry.status_code = status.as_u16();
        entry.response_headers = flatten_headers(&upstream_headers);

        let (body, captured) = capture_body(upstream).await;
        if let Some(bytes) = captured {
            entry.response_body = loggable_body(&upstream_headers, &bytes);
        }

        let mut response = Response::new(
            RecordOnRelay {
                inner: body,
                entry: Some(entry),
                activity: self.activity.clone(),
            }
            .boxed_unsync(),
        );
        *response.status_mut() = status;
        *response.headers_mut() = strip_hop_by_hop(&upstream_headers);
        response
    }

    async fn send(&self, method: Method, url: &str, headers: &HeaderMap, body: Bytes) -> Result<reqwest::Response> {
        let mut request = self.client.request(method, url).headers(strip_hop_by_hop(headers));
        if !body.is_empty() {
            request = request.body(body);
        }
        Ok(request.send().await?)
    }
}

/// The target of an absolute-form request line, if it has one.
fn absolute_url(uri: &Uri) -> Option<String> {
    match (uri.scheme(), uri.authority()) {
        (Some(_), Some(_)) => Some(uri.to_string()),
        _ => None,
    }
}

/// Read the whole upstream body so it can be logged. If reading breaks off,
/// whatever was read plus the remainder of the stream is relayed uncaptured.
async fn capture_body(upstream: reqwest::Response) -> (ProxyBody, Option<Bytes>) {
    let mut chunks = upstream.bytes_stream();
    let mut buffer = BytesMut::new();
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(data) => buffer.extend_from_slice(&data),
            Err(e) => {
                warn!("Upstream body read failed, streaming without capture: {}", e);
                let head = stream::once(async move { Ok::<_, BoxError>(Frame::data(buffer.freeze())) });
                let rest = chunks.map(|chunk| chunk.map(Frame::data).map_err(BoxError::from));
                return (StreamBody::new(head.chain(rest)).boxed_unsync(), None);
            }
        }
    }
    let bytes = buffer.freeze();
    (full(bytes.clone()), Some(bytes))
}

/// Response body wrapper that stores the log record once hyper is done with
/// the body, i.e. after it has been written out or the write was abandoned.
struct RecordOnRelay {
    inner: ProxyBody,
    entry: Option<RequestLog>,
    activity: Arc<ActivityLog>,
}

impl Body for RecordOnRelay {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, BoxError>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for RecordOnRelay {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entry.take() {
            entry.finish();
            self.activity.record(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.append("x-multi", HeaderValue::from_static("a"));
        headers.append("x-multi", HeaderValue::from_static("b"));

        let out = strip_hop_by_hop(&headers);
        assert!(out.get(header::CONNECTION).is_none());
        assert!(out.get("proxy-connection").is_none());
        assert!(out.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(out.get(header::CONTENT_TYPE).unwrap(), "text/plain");
        assert_eq!(out.get_all("x-multi").iter().count(), 2);
    }

    #[test]
    fn only_absolute_form_has_a_target() {
        let uri: Uri = "http://example.org/hello?x=1".parse().unwrap();
        assert_eq!(absolute_url(&uri).as_deref(), Some("http://example.org/hello?x=1"));

        let uri: Uri = "/hello?x=1".parse().unwrap();
        assert_eq!(absolute_url(&uri), None);
    }

    #[tokio::test]
    async fn origin_form_is_bad_gateway_even_with_host() {
        let activity = Arc::new(ActivityLog::new());
        let forwarder = Forwarder::new(activity.clone()).unwrap();
        let req = Request::builder()
            .uri("/welcome")
            .header(header::HOST, "127.0.0.1:8080")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let response = forwarder.forward_plain(req, "10.0.0.9:5555".parse().unwrap()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let logs = activity.snapshot();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].url, "/welcome");
        assert_eq!(logs[0].status_code, 502);
    }

    #[tokio::test]
    async fn unreachable_origin_is_bad_gateway() {
        let activity = Arc::new(ActivityLog::new());
        let forwarder = Forwarder::new(activity.clone()).unwrap();

        // Bind then drop to get a port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let req = Request::builder()
            .uri(format!("http://127.0.0.1:{}/hello", port))
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = forwarder.forward_plain(req, "10.0.0.9:5555".parse().unwrap()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let logs = activity.snapshot();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status_code, 502);
        assert!(logs[0].response_body.is_empty());
        assert_eq!(logs[0].client_ip, "10.0.0.9:5555");
        assert_eq!(logs[0].protocol, "HTTP/1.1");
    }

    #[tokio::test]
    async fn record_is_stored_when_body_is_dropped() {
        let activity = Arc::new(ActivityLog::new());
        let body = RecordOnRelay {
            inner: full("done"),
            entry: Some(RequestLog::begin("GET", "http://example.org/", "HTTP/1.1")),
            activity: activity.clone(),
        };
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"done"));
        assert_eq!(activity.len(), 1);
    }
}
