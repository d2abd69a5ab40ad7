#![allow(dead_code)]

use std::convert::Infallible;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use packetpeek::{ActivityLog, CertificateAuthority, HostResolver, Proxy, RequestLog};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// RSA-4096 root generation is slow; one per test binary.
pub fn shared_ca() -> Arc<CertificateAuthority> {
    static CA: OnceLock<(tempfile::TempDir, Arc<CertificateAuthority>)> = OnceLock::new();
    CA.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_generate(dir.path().join("ca.key"), dir.path().join("ca.pem"))
            .unwrap();
        (dir, Arc::new(ca))
    })
    .1
    .clone()
}

/// Resolves every name to loopback without touching DNS.
pub struct Loopback;

#[async_trait]
impl HostResolver for Loopback {
    async fn lookup(&self, _host: &str) -> Vec<IpAddr> {
        vec![IpAddr::from([127, 0, 0, 1])]
    }
}

pub struct RunningProxy {
    pub addr: SocketAddr,
    pub activity: Arc<ActivityLog>,
    pub proxy: Proxy,
}

pub async fn start_proxy() -> RunningProxy {
    let activity = Arc::new(ActivityLog::new());
    let proxy = Proxy::new(shared_ca(), Arc::new(Loopback), activity.clone()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(proxy.clone().serve(listener));
    RunningProxy { addr, activity, proxy }
}

pub const GZIPPED_TEXT: &str = "{\"compressed\":\"hello\"}";

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Echo origin: `/gzip*` answers with [`GZIPPED_TEXT`] gzip-encoded; anything
/// else answers with the method, path and the raw request body, and
/// reports what it received in `x-origin-*` headers.
async fn echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().to_string();
    let path = req.uri().path_and_query().map(|pq| pq.to_string()).unwrap_or_default();
    let encoding = req
        .headers()
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = req.into_body().collect().await.map(|c| c.to_bytes()).unwrap_or_default();
    if path.starts_with("/gzip") {
        let response = Response::builder()
            .header("content-encoding", "gzip")
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(gzip(GZIPPED_TEXT.as_bytes()))))
            .unwrap();
        return Ok(response);
    }
    let response = Response::builder()
        .status(if path.starts_with("/missing") { 404 } else { 200 })
        .header("x-origin-method", method)
        .header("x-origin-path", path)
        .header("x-origin-encoding", encoding)
        .header("content-type", "application/octet-stream")
        .body(Full::new(body))
        .unwrap();
    Ok(response)
}

pub async fn start_http_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(echo))
                    .await;
            });
        }
    });
    addr
}

pub async fn start_https_origin() -> SocketAddr {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.signing_key.serialize_der()));
    let chain = vec![CertificateDer::from(cert.cert.der().to_vec())];
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else { return };
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service_fn(echo))
                    .await;
            });
        }
    });
    addr
}

/// Port with nothing listening on it.
pub fn closed_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

/// Records are stored once the response body has been relayed, which can
/// trail the client seeing the response by a moment.
pub async fn wait_for_logs(activity: &ActivityLog, count: usize) -> Vec<RequestLog> {
    for _ in 0..200 {
        if activity.len() >= count {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    activity.snapshot()
}

pub fn proxied_client(proxy: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{}", proxy)).unwrap())
        .no_gzip()
        .build()
        .unwrap()
}
