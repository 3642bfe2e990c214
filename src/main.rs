mod api;
mod config;
mod dashboard;
mod dispatch;
mod filter;
mod history;
mod roster;
mod session;
mod store;
mod view;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use parking_lot::Mutex;

use crate::{api::BackendClient, config::Settings, session::Session, store::SqliteStore};

#[derive(Debug, Parser)]
#[command(name = "fleetboard", version)]
struct Cli {
    /// Override FLEET_BACKEND_URL
    #[arg(long)]
    backend: Option<String>,

    /// Override FLEET_LISTEN_PORT
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let mut settings = Settings::load()?;
    if let Some(url) = cli.backend {
        settings.backend_base_url = url;
    }
    if let Some(port) = cli.port {
        settings.listen_port = port;
    }
    settings.validate()?;

    let store = SqliteStore::new(&settings.sqlite_path)?;
    store.init_db()?;

    let backend = BackendClient::new(&settings)?;
    let session = Arc::new(Mutex::new(Session::new(&settings, store.clone())?));

    log::info!(
        "app.start backend={} listen={}:{} sqlite={}",
        settings.backend_base_url,
        settings.listen_host,
        settings.listen_port,
        store.path()
    );

    // HTTP surface in the background; the poll loop drives the session.
    {
        let st = settings.clone();
        let sess = session.clone();
        let be = backend.clone();
        tokio::spawn(async move {
            if let Err(e) = dashboard::serve(st, sess, be).await {
                log::error!("http.error {}", e);
            }
        });
    }

    session::run(settings, backend, session).await?;
    Ok(())
}
