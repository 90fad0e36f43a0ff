//! Development collaboration relay.
//!
//! Listens on `INKPAD_RELAY_ADDR` (default `127.0.0.1:5000`). Log level via
//! `RUST_LOG`.

use inkpad_collab::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let server = RelayServer::new(RelayConfig::from_env());
    let listener = server.bind().await?;
    log::info!("inkpad relay listening on {}", listener.local_addr()?);

    tokio::select! {
        result = server.serve(listener) => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutting down");
            server.shutdown();
            Ok(())
        }
    }
}
