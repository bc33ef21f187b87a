//! wireward - Intercepting WireGuard proxy
//!
//! This is the main entry point for the wireward binary.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use wireward::config::Args;
use wireward::plugin::PluginManager;
use wireward::proxy::Proxy;
use wireward::{ProxyConfig, ProxyError};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level, args.json_log)?;

    let config = match ProxyConfig::load(args.env_file.as_ref()) {
        Ok(config) => config,
        Err(err @ ProxyError::Config(_)) => {
            error!("{err}");
            std::process::exit(2);
        }
        Err(err) => return Err(err.into()),
    };

    info!("wireward v{}", wireward::VERSION);
    info!(plugin_dir = %args.plugin_dir.display(), "plugin directory");
    info!(network_port = args.network_port, proxy_port = args.proxy_port, "starting tunnels");

    let plugins = Arc::new(PluginManager::new(args.plugin_dir.clone()));
    plugins.reload().await;

    let proxy = match Proxy::start(&config.network, args.network_port, &config.proxy, args.proxy_port, plugins).await
    {
        Ok(proxy) => proxy,
        Err(err @ ProxyError::Tunnel(_)) => {
            error!("{err}");
            std::process::exit(1);
        }
        Err(err) => return Err(err.into()),
    };

    let proxy_for_signals = proxy.clone();
    tokio::spawn(async move {
        handle_signals(proxy_for_signals).await;
    });

    proxy.wait_closed().await;
    info!("both tunnels closed, exiting");

    Ok(())
}

/// Wait for `SIGTERM`/Ctrl+C (graceful shutdown) or `SIGUSR1` (plugin
/// reload) and act on them for as long as the proxy is running.
#[cfg(unix)]
async fn handle_signals(proxy: Arc<Proxy>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to install SIGTERM handler: {e}");
            return;
        }
    };
    let mut sigusr1 = match signal(SignalKind::user_defined1()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to install SIGUSR1 handler: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl+C, shutting down");
                proxy.close().await;
                return;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                proxy.close().await;
                return;
            }
            _ = sigusr1.recv() => {
                info!("received SIGUSR1, reloading plugins");
                let ok = proxy.reload().await;
                if !ok {
                    error!("one or more plugins failed to reload, see above");
                }
            }
        }
    }
}

/// Windows only gets Ctrl+C; there is no SIGUSR1 equivalent wired up.
#[cfg(not(unix))]
async fn handle_signals(proxy: Arc<Proxy>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("received Ctrl+C, shutting down");
    proxy.close().await;
}

/// Set up the global `tracing` subscriber based on CLI flags.
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    if json {
        let subscriber = FmtSubscriber::builder().with_max_level(level).json().finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
