//! Gateway entrypoint: settings, venue registration, serve until signalled.

use std::sync::Arc;

use clap::{Arg, Command};
use tokio::net::TcpListener;
use tracing::{error, info};

use candela::{Router, server, shutdown};
use candela_binance::BinanceConnector;
use candela_core::{RestPool, Settings};
use candela_okx::OkxConnector;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    let matches = Command::new("candela")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Expose normalized venue candle streams over a WebSocket server")
        .arg(
            Arg::new("host")
                .long("host")
                .help("Host/IP to bind the WebSocket server"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_parser(clap::value_parser!(u16))
                .help("Port to bind the WebSocket server"),
        )
        .get_matches();

    let host = matches
        .get_one::<String>("host")
        .cloned()
        .unwrap_or_else(|| settings.server.host.clone());
    let port = matches
        .get_one::<u16>("port")
        .copied()
        .unwrap_or(settings.server.port);

    let rest = Arc::new(RestPool::new(&settings.connector));
    let router = match Router::builder(settings.clone())
        .with_venue(Arc::new(BinanceConnector::new(Arc::clone(&rest))))
        .with_venue(Arc::new(OkxConnector::new(Arc::clone(&rest))))
        .build()
    {
        Ok(router) => router,
        Err(e) => {
            error!(error = %e, "failed to build router");
            std::process::exit(2);
        }
    };

    let listener = match TcpListener::bind((host.as_str(), port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%host, port, error = %e, "failed to bind websocket server");
            std::process::exit(1);
        }
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        %host,
        port,
        "candela gateway listening"
    );

    let shutdown = shutdown::shutdown_signal();
    server::serve(listener, router, Arc::new(settings), shutdown).await;

    rest.shutdown();
    info!("server shutdown complete");
}
