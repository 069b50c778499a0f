mod agent;
mod auth;
mod cancel;
mod config;
mod db;
mod sandbox;
mod session;
mod signaling;
mod skills;
mod tls;
mod translator;
mod watcher;
mod web;
mod workspace;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::agent::StubAgentFactory;
use crate::db::Db;
use crate::sandbox::SandboxManager;
use crate::session::RuntimeTable;
use crate::skills::SkillRegistry;
use crate::watcher::WatcherRegistry;
use crate::web::{AppState, LoginRateLimiter};

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/forged.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config_path, port_override) = parse_args();

    let mut config = config::load_config(&config_path)?;
    if let Some(p) = port_override {
        config.server.port = p;
    }
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    if !std::path::Path::new(&config.server.web_root).is_dir() {
        tracing::warn!(
            "Web root '{}' does not exist — the UI will not load. \
             Build the web client or set server.web_root in the config.",
            config.server.web_root
        );
    }

    let port = config.server.port;
    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, port)
        .parse()
        .context("Invalid bind address")?;

    let tls_state_dir = format!("{}/tls", config.server.data_root);
    let tls_result = tls::build_tls_config(
        config.server.tls_cert.as_deref(),
        config.server.tls_key.as_deref(),
        &tls_state_dir,
    )?;
    let tls_acceptor = tls::make_acceptor(tls_result.config);

    let db_path = PathBuf::from(&config.server.data_root).join("forge.sqlite");
    let db = Db::connect(&db_path)
        .await
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

    let sandbox = Arc::new(SandboxManager::new(config.sandbox.clone()));
    if sandbox.is_enabled() && !sandbox.available().await {
        tracing::warn!(
            "sandbox.enabled is true but '{}' is not reachable; sessions will fall back to host execution",
            config.sandbox.runtime_binary
        );
    }

    let skills_dir = PathBuf::from(&config.sandbox.skills_dir);
    let skills = SkillRegistry::load(&skills_dir);
    tracing::info!(count = skills.list().len(), "Loaded skill definitions");

    let runtimes = RuntimeTable::new(Arc::clone(&sandbox), Arc::new(StubAgentFactory));

    let state = Arc::new(AppState {
        config,
        db,
        sandbox,
        watchers: WatcherRegistry::new(),
        skills,
        runtimes,
        login_limiter: LoginRateLimiter::new(5, 60),
        started_at: std::time::Instant::now(),
        metrics_logins_attempted: std::sync::atomic::AtomicU64::new(0),
        metrics_logins_failed: std::sync::atomic::AtomicU64::new(0),
        metrics_sessions_created: std::sync::atomic::AtomicU64::new(0),
    });

    let app = web::build_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, "started");
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!("===========================================");
    tracing::info!("  Session Runtime server");
    tracing::info!("  Listening on https://{bind_addr}");
    tracing::info!("===========================================");

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    tracing::info!("Server ready, accepting connections");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("Failed to accept TCP connection: {e}");
                        continue;
                    }
                };

                let acceptor = tls_acceptor.clone();
                let app = app.clone();

                tokio::spawn(async move {
                    let tls_stream = match tokio::time::timeout(
                        std::time::Duration::from_secs(10),
                        acceptor.accept(stream),
                    ).await {
                        Ok(Ok(s)) => s,
                        Ok(Err(e)) => {
                            tracing::debug!(%peer_addr, "TLS handshake failed: {e}");
                            return;
                        }
                        Err(_) => {
                            tracing::debug!(%peer_addr, "TLS handshake timed out");
                            return;
                        }
                    };

                    let io = hyper_util::rt::TokioIo::new(tls_stream);
                    let hyper_service = hyper_util::service::TowerToHyperService::new(app);
                    let builder = hyper_util::server::conn::auto::Builder::new(
                        hyper_util::rt::TokioExecutor::new(),
                    );

                    if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
                        tracing::debug!(%peer_addr, "Connection error: {e}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
                break;
            }
        }
    }

    // Sandbox containers are left running; they're re-discovered by their
    // canonical name (`ensure`) on the next startup, so there's nothing to
    // persist here. Only the in-process runtime bookkeeping is torn down.
    state.runtimes.dispose_all().await;

    tracing::info!("Server shut down cleanly");

    Ok(())
}
