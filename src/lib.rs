//! PacketPeek: an intercepting HTTP/HTTPS proxy.
//!
//! Plain HTTP requests are forwarded as-is. CONNECT tunnels are terminated
//! with a leaf certificate minted on the fly and signed by a local root CA,
//! so the decrypted requests can be logged before they are re-sent to the
//! origin over a fresh TLS connection. Every completed exchange lands in a
//! bounded [`ActivityLog`] and is pushed to live subscribers.

pub mod activity;
pub mod api;
pub mod ca;
pub mod client_profile;
pub mod config;
pub mod error;
pub mod forward;
pub mod intercept;
pub mod leaf;
pub mod proxy;
pub mod record;
pub mod store;

pub use activity::{ActivityLog, SubscriberId, Subscription};
pub use api::ApiServer;
pub use ca::CertificateAuthority;
pub use config::Config;
pub use error::{Error, Result};
pub use leaf::{HostResolver, LeafCertificate, LeafIssuer, SystemResolver};
pub use proxy::Proxy;
pub use record::RequestLog;
pub use store::{AppStore, MockResponse, MockStore, MonitoredApp};
