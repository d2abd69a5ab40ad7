//! CONNECT tunnels: take over the client connection, terminate its TLS with a
//! forged leaf certificate and relay every decrypted request to the origin.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http::{Request, Response, StatusCode};
use hyper::body::{Body, Incoming};
use hyper::ext::ReasonPhrase;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::client_profile::ClientProfile;
use crate::error::{Error, Result};
use crate::forward::{Forwarder, ProxyBody, collect_request, empty, text_response};
use crate::leaf::LeafIssuer;
use crate::record::{PROTOCOL_HTTPS, RequestLog, flatten_headers, loggable_body};

const DEFAULT_TLS_PORT_SUFFIX: &str = ":443";

/// What a tunnel remembers about the CONNECT that opened it.
#[derive(Debug, Clone)]
struct Tunnel {
    authority: String,
    client_addr: SocketAddr,
    profile: ClientProfile,
}

impl Tunnel {
    /// `https://host` for the default port, `https://host:port` otherwise.
    fn origin(&self) -> String {
        let host = self.authority.strip_suffix(DEFAULT_TLS_PORT_SUFFIX).unwrap_or(&self.authority);
        format!("https://{}", host)
    }
}

#[derive(Clone)]
pub struct Interceptor {
    issuer: Arc<LeafIssuer>,
    forwarder: Forwarder,
}

impl Interceptor {
    pub fn new(issuer: Arc<LeafIssuer>, forwarder: Forwarder) -> Self {
        Interceptor { issuer, forwarder }
    }

    /// Answer a CONNECT.
    ///
    /// On success the client gets `200 Connection Established` and the tunnel
    /// continues on its own task once hyper hands over the connection. A
    /// connection that cannot be taken over gets a 500. If no certificate can
    /// be issued an error is returned, which makes hyper drop the connection
    /// without writing a response.
    pub async fn handle_connect<B>(&self, mut req: Request<B>, client_addr: SocketAddr) -> Result<Response<ProxyBody>>
    where
        B: Body,
    {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_else(|| req.uri().to_string());
        let profile = ClientProfile::from_headers(req.headers());

        let mut entry = RequestLog::begin(req.method().as_str(), format!("https://{}", authority), PROTOCOL_HTTPS);
        entry.client_ip = client_addr.to_string();
        entry.request_headers = flatten_headers(req.headers());
        entry.user_agent = profile.user_agent.clone();
        entry.apply_profile(&profile);

        let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
            warn!(authority, "Connection cannot be hijacked, rejecting CONNECT");
            self.reject(entry);
            return Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, Error::HijackUnsupported.to_string()));
        };

        let tls_config = match self.issuer.issue(&authority).await.and_then(|leaf| leaf.server_config()) {
            Ok(config) => config,
            Err(e) => {
                warn!(authority, "Failed to issue certificate: {}", e);
                self.reject(entry);
                return Err(e);
            }
        };

        let tunnel = Tunnel {
            authority,
            client_addr,
            profile,
        };
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));
        let this = self.clone();
        tokio::spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    debug!(authority = %tunnel.authority, "Connection upgrade failed: {}", e);
                    return;
                }
            };
            let tls = match acceptor.accept(TokioIo::new(upgraded)).await {
                Ok(tls) => tls,
                Err(e) => {
                    warn!(authority = %tunnel.authority, client = %tunnel.client_addr, "TLS handshake failed: {}", e);
                    this.reject(entry);
                    return;
                }
            };
            info!(authority = %tunnel.authority, client = %tunnel.client_addr, "Tunnel established");
            this.serve_tunnel(TokioIo::new(tls), tunnel).await;
        });

        let mut response = Response::new(empty());
        response.extensions_mut().insert(ReasonPhrase::from_static(b"Connection Established"));
        Ok(response)
    }

    /// Store the preliminary CONNECT entry for a tunnel that never got going.
    fn reject(&self, mut entry: RequestLog) {
        entry.status_code = StatusCode::INTERNAL_SERVER_ERROR.as_u16();
        entry.finish();
        self.forwarder.activity().record(entry);
    }

    /// Request loop over the decrypted stream. Ends when the client closes,
    /// sends something unparseable or a response cannot be written.
    async fn serve_tunnel<I>(&self, io: I, tunnel: Tunnel)
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let tunnel = Arc::new(tunnel);
        let service = {
            let tunnel = tunnel.clone();
            let this = self.clone();
            service_fn(move |req: Request<Incoming>| {
                let this = this.clone();
                let tunnel = tunnel.clone();
                async move { Ok::<_, Infallible>(this.intercept_request(req, &tunnel).await) }
            })
        };

        match http1::Builder::new().serve_connection(io, service).await {
            Ok(()) => debug!(authority = %tunnel.authority, "Tunnel closed"),
            Err(e) if e.is_incomplete_message() => debug!(authority = %tunnel.authority, "Client left mid-request"),
            Err(e) => warn!(authority = %tunnel.authority, "Tunnel closed with error: {}", e),
        }
    }

    async fn intercept_request<B>(&self, req: Request<B>, tunnel: &Tunnel) -> Response<ProxyBody>
    where
        B: Body + Send,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = collect_request(req).await;
        let path = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let url = format!("{}{}", tunnel.origin(), path);
        let inner = ClientProfile::from_headers(&parts.headers);

        let mut entry = RequestLog::begin(parts.method.as_str(), url.clone(), PROTOCOL_HTTPS);
        entry.client_ip = tunnel.client_addr.to_string();
        entry.request_headers = flatten_headers(&parts.headers);
        entry.request_body = loggable_body(&parts.headers, &body);
        entry.user_agent = inner.user_agent;
        entry.apply_profile(&tunnel.profile);

        debug!(method = %parts.method, url = %url, "Intercepted request");
        self.forwarder.exchange(parts.method, &url, &parts.headers, body, entry).await
    }
}
