//! Bridge entry point: validates env configuration, wires up the transport
//! factory, and hands control to the manager until SIGINT/SIGTERM.
//!
//! Exit codes: 0 = clean shutdown, 1 = configuration error, 2 = fatal
//! runtime error.

mod automation;
mod config;
mod discovery;
mod history;
mod manager;
mod mock;
mod model;
mod mqtt;
mod pdu_config;
mod poller;
mod state;
mod transport;
mod web;

use std::sync::Arc;
use tracing::error;

use config::BridgeConfig;
use manager::{BridgeManager, TransportFactory};
use mock::MockPdu;
use transport::Transport;

#[tokio::main]
async fn main() {
    let config = match BridgeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .init();

    // The SNMP and serial back-ends are plugged in through this factory;
    // this build ships the simulated transport for mock mode.
    let factory: TransportFactory = if config.mock_mode {
        Arc::new(|cfg: &pdu_config::PduConfig| {
            Ok(Box::new(MockPdu::new(10, cfg.num_banks, "PDU44001")) as Box<dyn Transport>)
        })
    } else {
        Arc::new(|cfg: &pdu_config::PduConfig| {
            anyhow::bail!(
                "no SNMP/serial transport is linked into this build for {:?}; \
                 set BRIDGE_MOCK_MODE=true or supply a transport",
                cfg.device_id
            )
        })
    };

    let manager = match BridgeManager::new(config, factory, None, None).await {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("Configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = manager.run().await {
        error!("fatal error: {e:#}");
        std::process::exit(2);
    }
}
