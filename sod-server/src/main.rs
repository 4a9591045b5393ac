// SOD Server - HTTP ingest/predict API
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # SOD server
//!
//! Binary entry point: loads the environment configuration, opens the
//! store, wires the alert manager and dispatcher, serves the HTTP API
//! and coordinates graceful shutdown on SIGINT/SIGTERM.
//!
//! ```bash
//! # Collect mode on the default port
//! sod-srv
//!
//! # Scrape mode, custom address
//! SOD_SVC_MODE=SCRAPE sod-srv --addr 127.0.0.1:9000
//! ```

mod config;
mod handlers;
mod scrape;

use clap::Parser;
use config::{Config, SvcMode};
use handlers::AppState;
use scrape::ScrapeManager;
use sod_engine::alert::AlertManager;
use sod_engine::error::Result as EngineResult;
use sod_engine::store::Store;
use sod_engine::Dispatcher;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// SOD - streaming outlier detection server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen address, overriding SOD_ADDR
    #[arg(long)]
    addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("SOD server v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(args).await {
        error!(error = %e, "fatal");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::from_env()?;
    if let Some(addr) = args.addr {
        config.addr = addr;
    }

    let store = Store::open(&config.db_file)?;
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<EngineResult<()>>();

    let notifier = AlertManager::new(store.alerts(), config.alert.clone())?;
    let dispatcher = Dispatcher::new(
        &store,
        config.predictor.clone(),
        notifier,
        shutdown_tx.clone(),
        config.engine.clone(),
    )?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    dispatcher.clone().run(cancel.clone()).await?;

    // worker coordinator + flusher + alert manager, plus the scraper.
    let mut completions = 3usize;
    if config.svc_mode == SvcMode::Scrape {
        let scraper = ScrapeManager::new(config.scrape.clone(), dispatcher.clone())?;
        tokio::spawn(scraper.run(cancel.clone(), shutdown_tx.clone()));
        completions += 1;
    }

    let state = AppState {
        dispatcher,
        collect_timeout: config.collect_request_timeout,
        predict_timeout: config.predict_request_timeout,
        predict_max_items: config.predict_max_data_items,
    };
    let app = handlers::router(state, config.svc_mode);

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, mode = ?config.svc_mode, "listening");

    let serve_cancel = cancel.clone();
    tokio::spawn(async move {
        let shutdown = serve_cancel.clone();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "http server failed");
            serve_cancel.cancel();
        }
    });

    // The shutdown barrier: each subsystem reports exactly once after the
    // cancellation fires; the first error becomes the exit status.
    let mut first_err = None;
    for _ in 0..completions {
        match shutdown_rx.recv().await {
            Some(Err(e)) if first_err.is_none() => first_err = Some(e),
            Some(_) => {}
            None => break,
        }
    }

    info!("shutdown complete");
    match first_err {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("installing SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received");
        cancel.cancel();
    });
}
