#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # dialback
//!
//! Reverse HTTP tunnel for hosts without inbound connectivity.
//!
//! ## Subcommands
//!
//! - `dialback serve`: run the public endpoint. Requests carrying the shared
//!   secret become tunnels; everything else is forwarded over the active
//!   tunnel, or answered with 404 JSON when there is none.
//! - `dialback dial`: dial the endpoint and answer tunneled requests from a
//!   local upstream (or a built-in greeting). Reconnects with backoff.
//!
//! ## Endpoint surface
//!
//! | Method | Path                 | Description                              |
//! |--------|----------------------|------------------------------------------|
//! | GET    | `/_dialback/health`  | Liveness probe plus tunnel status        |
//! | any    | secret handshake     | Upgrade to a tunnel (`101`)              |
//! | any    | anything else        | Forwarded over the tunnel, else 404 JSON |

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use axum::http::Uri;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dialback::auth::fingerprint;
use dialback::config::{Config, Placement};
use dialback::error::{ConfigError, DialError};
use dialback::tunnel::{dial_and_serve, DialOptions};
use dialback::{routes, upstream, ClientProxy};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Reverse HTTP tunnel for hosts without inbound connectivity.
#[derive(Parser)]
#[command(name = "dialback", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the public endpoint.
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Dial an endpoint and serve tunneled requests locally.
    Dial {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Endpoint URL, overriding `[dial] url`.
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = match &cli.command {
        Commands::Serve { config } | Commands::Dial { config, .. } => config.clone(),
    };
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("dialback: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let result = match cli.command {
        Commands::Serve { .. } => run_server(config).await,
        Commands::Dial { url, .. } => run_dialer(config, url).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: Config) -> Result<(), BoxError> {
    let proxy = ClientProxy::new(config.proxy.clone(), config.yamux.clone())?;

    info!("dialback v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        transport = config.proxy.transport.as_str(),
        placement = ?config.proxy.placement,
        secret = %proxy.fingerprint(),
        "Tunnel endpoint configured"
    );
    if config.proxy.placement == Placement::Path {
        warn!("Path placement puts the secret in request lines and access logs");
    }

    let app = routes::default_router(proxy.clone());
    let listener = TcpListener::bind(&config.server.listen).await?;
    info!("Listening on {}", config.server.listen);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    proxy.shutdown().await;
    info!("Goodbye");
    Ok(())
}

async fn run_dialer(config: Config, url: Option<String>) -> Result<(), BoxError> {
    let dial = &config.dial;
    let url = url
        .or_else(|| dial.url.clone())
        .ok_or(ConfigError::MissingDialUrl)?;

    let mut options = DialOptions::new(dial.transport).with_yamux(config.yamux.clone());
    if let Some(header) = &dial.header_name {
        let secret = dial
            .secret
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| config.proxy.secret.clone());
        if secret.is_empty() {
            return Err(ConfigError::MissingSecret.into());
        }
        options = options.with_secret_header(header, &secret)?;
        info!(secret = %fingerprint(&secret), "Sending secret in {header}");
    }

    let handler = upstream::local_router(dial.upstream.as_deref(), dial.max_concurrent_requests)?;
    match &dial.upstream {
        Some(upstream) => info!("Forwarding tunneled requests to {upstream}"),
        None => info!("No upstream configured, answering with greeting"),
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let endpoint = endpoint_of(&url);
    let base_delay = Duration::from_secs(dial.reconnect_delay_secs);
    let max_delay = Duration::from_secs(dial.reconnect_max_delay_secs);
    let mut delay = base_delay;

    loop {
        info!("Dialing {endpoint}");
        let started = Instant::now();
        match dial_and_serve(&url, handler.clone(), &options, cancel.clone()).await {
            Ok(()) => {
                info!("Tunnel closed");
                delay = base_delay;
            }
            Err(e @ DialError::InvalidUrl { .. }) => return Err(e.into()),
            Err(e) => {
                // A tunnel that stayed up for a while starts over at the base delay.
                if started.elapsed() > max_delay {
                    delay = base_delay;
                }
                warn!("Tunnel error: {e}, reconnecting in {}s", delay.as_secs());
            }
        }
        if cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => break,
        }
        delay = (delay * 2).min(max_delay);
    }

    info!("Goodbye");
    Ok(())
}

/// `scheme://authority` of `url`, without a path that may carry the secret.
fn endpoint_of(url: &str) -> String {
    url.parse::<Uri>()
        .ok()
        .and_then(|uri| {
            let authority = uri.authority()?;
            Some(format!("{}://{authority}", uri.scheme_str().unwrap_or("http")))
        })
        .unwrap_or_else(|| "<invalid url>".to_string())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
