mod categories;
mod config;
mod error;
mod gateway;
mod inference;
mod poller;
mod queue;
mod ratelimit;
mod records;
mod report;
mod routes;
mod storage;
mod sweeper;
mod utils;
mod worker;


#[macro_use]
extern crate tracing;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use mimalloc::MiMalloc;
use poem::listener::TcpListener;
use poem::Server;

use crate::routes::AppraiseApi;
use crate::sweeper::PurgeSweeper;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Debug, Parser)]
#[clap(author, version, about)]
pub struct ServerConfig {
    #[clap(short, long, env, default_value = "127.0.0.1")]
    /// The binding host address of the server.
    host: String,

    #[clap(short, long, env, default_value = "8000")]
    port: u16,

    #[clap(short, long, env)]
    /// The external URL that would be used to access the server if applicable.
    ///
    /// This only affects the documentation.
    external_url: Option<String>,

    #[clap(long, env, default_value = "info")]
    /// The log level filter, any logs that are above this level won't
    /// be displayed.
    log_level: tracing::Level,

    #[clap(long, env)]
    /// The file path to a given config file.
    ///
    /// This can be either a JSON formatted config or YAML.
    config_file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: ServerConfig = ServerConfig::parse();
    let bind = format!("{}:{}", args.host, args.port);
    let bind: SocketAddr = bind.parse()?;

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    if let Err(e) = config::init(&args.config_file).await {
        error!("Failed to load config file {:?}: {}", args.config_file, e);
        return Err(e);
    }

    let cfg = config::config().clone();

    let store = cfg.backend.connect().await?;
    let inference = cfg.inference.connect()?;
    info!(categories = cfg.categories.len(), "Pipeline configured");

    let sweeper = Arc::new(PurgeSweeper::new(store.clone(), cfg.session_ttl()));
    sweeper.clone().spawn(cfg.purge_interval());

    let api = AppraiseApi::new(cfg.clone(), store, inference, sweeper);
    let server_url = args
        .external_url
        .unwrap_or_else(|| format!("http://{}", bind));
    let app = routes::build_app(api, cfg.rate_limit.clone(), &server_url);

    info!("Appraise is now serving on http://{}", bind);
    info!("Docs are available at {}/ui", server_url);

    Server::new(TcpListener::bind(bind))
        .run(app)
        .await?;

    Ok(())
}
