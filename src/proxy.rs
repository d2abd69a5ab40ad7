//! Listener side of the proxy: accepts client connections and routes each
//! request to plain forwarding or CONNECT interception.

use std::net::SocketAddr;
use std::sync::Arc;

use http::{Method, Request, Response};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::activity::{ActivityLog, SubscriberId, Subscription};
use crate::ca::CertificateAuthority;
use crate::error::Result;
use crate::forward::{Forwarder, ProxyBody};
use crate::intercept::Interceptor;
use crate::leaf::{HostResolver, LeafIssuer};
use crate::record::RequestLog;

#[derive(Clone)]
pub struct Proxy {
    forwarder: Forwarder,
    interceptor: Interceptor,
    activity: Arc<ActivityLog>,
}

impl Proxy {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        resolver: Arc<dyn HostResolver>,
        activity: Arc<ActivityLog>,
    ) -> Result<Self> {
        let forwarder = Forwarder::new(activity.clone())?;
        let issuer = Arc::new(LeafIssuer::new(ca, resolver));
        Ok(Proxy {
            interceptor: Interceptor::new(issuer, forwarder.clone()),
            forwarder,
            activity,
        })
    }

    /// Entry point for every inbound request.
    pub async fn handle<B>(&self, req: Request<B>, client_addr: SocketAddr) -> Result<Response<ProxyBody>>
    where
        B: Body + Send,
        B::Error: std::fmt::Display,
    {
        if req.method() == Method::CONNECT {
            self.interceptor.handle_connect(req, client_addr).await
        } else {
            Ok(self.forwarder.forward_plain(req, client_addr).await)
        }
    }

    /// Accept connections forever, one task each.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "Proxy listening");
        loop {
            let (stream, client_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    continue;
                }
            };
            let proxy = self.clone();
            tokio::spawn(async move { proxy.serve_connection(stream, client_addr).await });
        }
    }

    /// Serve one client connection until it closes. Upgrades stay enabled so
    /// CONNECT tunnels can take the connection over.
    pub async fn serve_connection(&self, stream: TcpStream, client_addr: SocketAddr) {
        debug!(client = %client_addr, "Accepted connection");
        let proxy = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let proxy = proxy.clone();
            async move { proxy.handle(req, client_addr).await }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
        {
            debug!(client = %client_addr, "Connection ended: {}", e);
        }
    }

    pub fn logs(&self) -> Vec<RequestLog> {
        self.activity.snapshot()
    }

    pub fn subscribe(&self) -> Subscription {
        self.activity.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.activity.unsubscribe(id)
    }

    pub fn activity(&self) -> &Arc<ActivityLog> {
        &self.activity
    }
}
