//! `gatehouse` binary.

use clap::{Parser, Subcommand};
use gatehouse_core::{Clock, SystemClock};
use gatehouse_gateway::{Gateway, GatewayConfig, GatewayServer, Target};
use gatehouse_security::{JwtCodec, TokenPayload};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gatehouse", about = "Gatehouse — API gateway")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "gatehouse.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print the resolved route table
    Routes,
    /// Mint a bearer token signed with the configured secret
    Token {
        /// Subject
        #[arg(long)]
        sub: String,
        /// Comma-separated roles
        #[arg(long, default_value = "")]
        roles: String,
        /// Comma-separated permissions
        #[arg(long, default_value = "")]
        permissions: String,
        /// Lifetime in seconds (defaults to jwt.expiration)
        #[arg(long)]
        ttl: Option<u64>,
    },
}

fn split_list(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    if let Ok(path) = dotenvy::dotenv() {
        info!(path = %path.display(), "Loaded environment file");
    }

    let cli = Cli::parse();

    let config = GatewayConfig::load(&cli.config).await.map_err(|e| {
        anyhow::anyhow!("Failed to load config '{}': {e}", cli.config.display())
    })?;

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            let maintenance = Duration::from_secs(config.gateway.maintenance_interval.max(1));

            let gateway = Arc::new(Gateway::from_config(config)?);
            info!(
                routes = gateway.routes().len(),
                "Starting Gatehouse on {host}:{port}"
            );
            let janitor = gateway.spawn_maintenance(maintenance);

            let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
            GatewayServer::serve(gateway, listener, shutdown_signal()).await?;

            janitor.abort();
            info!("Gatehouse stopped");
        }
        Commands::Routes => {
            let gateway = Gateway::from_config(config)?;
            println!("Routes:");
            for route in gateway.routes().routes() {
                let methods: Vec<String> = route.methods.iter().map(ToString::to_string).collect();
                let target = match &route.target {
                    Target::Local(id) => format!("handler {id}"),
                    Target::Remote(service) => format!("upstream {service}"),
                };
                let mut flags = Vec::new();
                if route.public {
                    flags.push("public");
                }
                if !route.cacheable {
                    flags.push("no-cache");
                }
                println!(
                    "  {:<8} {:<28} -> {target} {}",
                    methods.join(","),
                    route.path,
                    flags.join(" ")
                );
            }
            println!("\nTotal: {} route(s)", gateway.routes().len());
        }
        Commands::Token {
            sub,
            roles,
            permissions,
            ttl,
        } => {
            let now = SystemClock.now_secs();
            let payload = TokenPayload {
                sub,
                roles: split_list(&roles),
                permissions: split_list(&permissions),
                claims: None,
                iat: now,
                exp: now + ttl.unwrap_or(config.jwt.expiration),
                jti: Some(uuid::Uuid::new_v4().simple().to_string()),
            };
            let token = JwtCodec::new(&config.jwt.secret).encode(&payload)?;
            println!("{token}");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
