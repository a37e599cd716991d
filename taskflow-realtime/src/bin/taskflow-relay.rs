//! Standalone relay: `taskflow-relay [bind_addr]`.
//!
//! The bind address may also come from `TASKFLOW_RELAY_ADDR`; log level
//! from `RUST_LOG`.

use taskflow_realtime::server::{CoordinationServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Some(addr) = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TASKFLOW_RELAY_ADDR").ok())
    {
        config.bind_addr = addr;
    }
    if let Ok(ttl) = std::env::var("TASKFLOW_LOCK_TTL_SECS") {
        match ttl.parse() {
            Ok(secs) => config.lock_ttl_secs = secs,
            Err(e) => log::warn!("Ignoring TASKFLOW_LOCK_TTL_SECS={ttl}: {e}"),
        }
    }

    log::info!("Starting Taskflow relay on {}...", config.bind_addr);
    let server = CoordinationServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
