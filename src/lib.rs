//! # wireward
//!
//! An intercepting WireGuard proxy. It terminates two WireGuard
//! tunnels — a "network" side facing the untrusted network and a
//! "proxy" side facing the protected service — reassembles the
//! TCP/UDP/other-IP traffic carried between them, and passes every
//! packet or byte stream through a pluggable, hot-reloadable
//! processing pipeline that can observe, rewrite, or drop traffic.
//!
//! ## Architecture
//!
//! ```text
//! untrusted network <--WireGuard--> [network tunnel] -- Proxy -- [proxy tunnel] <--WireGuard--> protected service
//!                                                          |
//!                                                    PluginManager
//! ```
//!
//! [`proxy::Proxy`] pairs the two [`tunnel::TunnelServer`] endpoints and
//! hands every new TCP connection to a [`connection::ProxyConnection`],
//! which runs two forwarding tasks (one per direction) through the
//! five-stage hook chain exposed by [`plugin::PluginManager`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use wireward::config::ProxyConfig;
//! use wireward::plugin::PluginManager;
//! use wireward::proxy::Proxy;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ProxyConfig::load(None)?;
//!     let plugins = Arc::new(PluginManager::new("./plugins"));
//!     plugins.reload().await;
//!     let proxy = Proxy::start(&config.network, 51820, &config.proxy, 51821, plugins).await?;
//!     proxy.wait_closed().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod connection;
pub mod error;
pub mod plugin;
pub mod proxy;
pub mod shared;
pub mod stream;
pub mod tunnel;

pub use config::ProxyConfig;
pub use connection::ProxyConnection;
pub use error::ProxyError;
pub use plugin::PluginManager;
pub use proxy::Proxy;
pub use stream::Stream;

/// Version of the wireward library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application.
pub const NAME: &str = env!("CARGO_PKG_NAME");
