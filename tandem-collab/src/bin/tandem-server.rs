//! Standalone sync server.
//!
//! Configuration via environment:
//! - `TANDEM_ADDR` — bind address (default 127.0.0.1:9600)
//! - `PORT` — overrides the port part only, for platforms that inject it
//! - `TANDEM_GRACE_SECS` — empty-session grace period in seconds

use tandem_collab::server::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("TANDEM_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(port) = std::env::var("PORT") {
        let host = config
            .bind_addr
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        config.bind_addr = format!("{host}:{port}");
    }
    if let Ok(secs) = std::env::var("TANDEM_GRACE_SECS") {
        match secs.parse() {
            Ok(secs) => config.grace_period_secs = secs,
            Err(_) => log::warn!("ignoring invalid TANDEM_GRACE_SECS={secs}"),
        }
    }

    let server = SyncServer::new(config);
    server.run().await
}
