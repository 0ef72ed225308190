//! anyops-server: control plane for a fleet of LLM inference nodes.
//!
//! Bootstrap order matters: the data blob and key pair come up first
//! so the password migration can run before any request is served.

mod audit;
mod auth;
mod bootstrap;
mod calculator;
mod containers;
mod deploy;
mod http;
mod keys;
mod models;
mod probe;
mod registry;
mod ssh;
mod store;
mod uploads;

use crate::audit::AuditLog;
use crate::auth::Sessions;
use crate::bootstrap::Bootstrapper;
use crate::http::AppState;
use crate::keys::IdentityStore;
use crate::registry::NodeRegistry;
use crate::store::Store;
use crate::uploads::UploadManager;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().init();

    let store = Store::open(Store::default_path()).context("opening data store")?;
    let data_dir = store
        .path()
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let ids = IdentityStore::new(data_dir.join("keys"));
    ids.ensure_keys().context("preparing SSH identity")?;
    keys::migrate_plaintext_passwords(&store, &ids).context("migrating stored passwords")?;

    let audit = AuditLog::new();
    let state = AppState {
        registry: NodeRegistry::new(),
        store,
        ids: ids.clone(),
        sessions: Sessions::new(),
        audit: audit.clone(),
        uploads: UploadManager::new(data_dir.join("models")),
        bootstrapper: Bootstrapper::new(ids, audit, data_dir.join("assets")),
    };

    let port: u16 = std::env::var("SERVER_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "control plane listening");

    axum::serve(listener, http::build_router(state))
        .await
        .context("serving HTTP")?;
    Ok(())
}
