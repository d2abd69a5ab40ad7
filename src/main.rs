use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use packetpeek::config::{self, Config, DEFAULT_API_PORT, DEFAULT_PROXY_PORT};
use packetpeek::{
    ActivityLog, ApiServer, AppStore, CertificateAuthority, MockStore, MonitoredApp, Proxy, SystemResolver,
};

#[derive(Parser)]
#[command(name = "packetpeek", version, about = "Intercepting HTTP/HTTPS proxy with a local root CA")]
struct Cli {
    /// Directory holding the root CA and the app/mock stores
    #[arg(long, global = true, env = "PACKETPEEK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy and the control API
    Run {
        #[arg(long, env = "PACKETPEEK_PROXY_ADDR", default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PROXY_PORT)))]
        proxy_addr: SocketAddr,
        #[arg(long, env = "PACKETPEEK_API_ADDR", default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_API_PORT)))]
        api_addr: SocketAddr,
    },
    /// Load or generate the root CA and print where its certificate lives
    Init,
    /// Manage monitored apps
    Apps {
        #[command(subcommand)]
        command: AppsCommand,
    },
    /// Manage mock responses
    Mocks {
        #[command(subcommand)]
        command: MocksCommand,
    },
}

#[derive(Subcommand)]
enum AppsCommand {
    List,
    Add {
        /// Bundle identifier (e.g., com.example.app)
        bundle_id: String,
        name: String,
        /// Mark the app's traffic for decryption
        #[arg(long)]
        decrypt: bool,
    },
    Remove {
        bundle_id: String,
    },
}

#[derive(Subcommand)]
enum MocksCommand {
    List,
    Remove { id: String },
}

fn load_ca(config: &Config) -> Result<Arc<CertificateAuthority>> {
    config
        .ensure_data_dir()
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;
    let ca = CertificateAuthority::load_or_generate(config.ca_key_path(), config.ca_cert_path())
        .context("Failed to load or generate the root CA")?;
    Ok(Arc::new(ca))
}

async fn run(config: Config) -> Result<()> {
    let ca = load_ca(&config)?;
    let activity = Arc::new(ActivityLog::new());

    let proxy = Proxy::new(ca.clone(), Arc::new(SystemResolver::new()), activity.clone())
        .context("Failed to set up the proxy")?;
    let api = ApiServer::new(
        activity,
        ca,
        Arc::new(AppStore::open(config.apps_path())),
        Arc::new(MockStore::open(config.mocks_path())),
    );

    let proxy_listener = TcpListener::bind(config.proxy_addr)
        .await
        .with_context(|| format!("Failed to bind proxy on {}", config.proxy_addr))?;
    let api_listener = TcpListener::bind(config.api_addr)
        .await
        .with_context(|| format!("Failed to bind control API on {}", config.api_addr))?;

    tokio::select! {
        result = proxy.serve(proxy_listener) => result.context("Proxy stopped")?,
        result = api.serve(api_listener) => result.context("Control API stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}

fn apps(config: &Config, command: AppsCommand) -> Result<()> {
    config.ensure_data_dir()?;
    let store = AppStore::open(config.apps_path());
    match command {
        AppsCommand::List => {
            for app in store.list() {
                let mode = if app.decrypt_traffic { "decrypt" } else { "pass-through" };
                println!("{}\t{}\t{}", app.bundle_id, app.name, mode);
            }
        }
        AppsCommand::Add {
            bundle_id,
            name,
            decrypt,
        } => {
            store.add(MonitoredApp {
                bundle_id: bundle_id.clone(),
                name,
                decrypt_traffic: decrypt,
            })?;
            println!("Added {}", bundle_id);
        }
        AppsCommand::Remove { bundle_id } => {
            if store.remove(&bundle_id)? {
                println!("Removed {}", bundle_id);
            } else {
                println!("No app with bundle id {}", bundle_id);
            }
        }
    }
    Ok(())
}

fn mocks(config: &Config, command: MocksCommand) -> Result<()> {
    config.ensure_data_dir()?;
    let store = MockStore::open(config.mocks_path());
    match command {
        MocksCommand::List => {
            for mock in store.list() {
                let state = if mock.is_active { "active" } else { "inactive" };
                println!(
                    "{}\t{} {}{}\t{}\t{}",
                    mock.id, mock.method, mock.host, mock.path, mock.status_code, state
                );
            }
        }
        MocksCommand::Remove { id } => {
            if store.remove(&id)? {
                println!("Removed mock {}", id);
            } else {
                println!("No mock with id {}", id);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("packetpeek=info")))
        .init();

    let cli = Cli::parse();
    let mut config = Config::new(cli.data_dir.unwrap_or_else(config::default_data_dir));

    let result = match cli.command {
        Commands::Run { proxy_addr, api_addr } => {
            config.proxy_addr = proxy_addr;
            config.api_addr = api_addr;
            run(config).await
        }
        Commands::Init => load_ca(&config).map(|ca| println!("Root CA certificate: {}", ca.cert_path().display())),
        Commands::Apps { command } => apps(&config, command),
        Commands::Mocks { command } => mocks(&config, command),
    };

    if let Err(err) = result {
        error!("{:#}", err);
        std::process::exit(1);
    }
}
