//! Runtime configuration: where state lives and where the listeners bind.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::{env, fs};

use crate::error::Result;

pub const CA_KEY_FILE: &str = "ca.key";
pub const CA_CERT_FILE: &str = "ca.pem";
pub const APPS_FILE: &str = "monitored_apps.json";
pub const MOCKS_FILE: &str = "mocks.json";

pub const DEFAULT_PROXY_PORT: u16 = 8080;
pub const DEFAULT_API_PORT: u16 = 8081;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub proxy_addr: SocketAddr,
    pub api_addr: SocketAddr,
}

impl Config {
    /// Config rooted at `data_dir`, listening on the default addresses.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Config {
            data_dir: data_dir.into(),
            proxy_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PROXY_PORT)),
            api_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_API_PORT)),
        }
    }

    /// Create the data directory if it does not exist yet.
    pub fn ensure_data_dir(&self) -> Result<&Path> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(&self.data_dir)
    }

    pub fn ca_key_path(&self) -> PathBuf {
        self.data_dir.join(CA_KEY_FILE)
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.data_dir.join(CA_CERT_FILE)
    }

    pub fn apps_path(&self) -> PathBuf {
        self.data_dir.join(APPS_FILE)
    }

    pub fn mocks_path(&self) -> PathBuf {
        self.data_dir.join(MOCKS_FILE)
    }
}

/// `$HOME/.packetpeek`, or `./.packetpeek` when HOME is unset.
pub fn default_data_dir() -> PathBuf {
    let mut dir = env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    dir.push(".packetpeek");
    dir
}
