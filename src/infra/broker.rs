//! Embedded MQTT broker using rumqttd
//!
//! Used for local runs against `mock_device` and by the channel integration
//! tests; field deployments point at an external broker instead.

use crate::infra::config::Config as AppConfig;
use anyhow::Context;
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

fn broker_config(listen: SocketAddr) -> Config {
    let router_config = RouterConfig {
        max_segment_size: 10 * 1024 * 1024,
        max_segment_count: 10,
        max_connections: 1000,
        max_outgoing_packet_count: 200,
        initialized_filters: None,
        ..Default::default()
    };

    let mut servers = HashMap::new();
    servers.insert(
        "v4".to_string(),
        ServerSettings {
            name: "v4".to_string(),
            listen,
            tls: None,
            next_connection_delay_ms: 1,
            connections: ConnectionSettings {
                connection_timeout_ms: 5000,
                max_payload_size: 262144,
                max_inflight_count: 200,
                auth: None,
                dynamic_filters: false,
                external_auth: None,
            },
        },
    );

    Config {
        id: 0,
        router: router_config,
        v4: Some(servers),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    }
}

/// Start a broker on `bind_address:port` in a background thread.
///
/// `Broker::start` blocks for the life of the process, so the thread is never
/// joined.
pub fn start_embedded_broker(bind_address: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let addr_str = format!("{bind_address}:{port}");
    let listen: SocketAddr = addr_str
        .parse()
        .with_context(|| format!("invalid broker bind address {addr_str}"))?;

    let config = broker_config(listen);
    thread::Builder::new()
        .name("mqtt-broker".to_string())
        .spawn(move || {
            let mut broker = Broker::new(config);
            if let Err(e) = broker.start() {
                warn!(error = %e, "broker_start_failed");
            }
        })
        .context("failed to spawn broker thread")?;

    // Give broker time to bind before clients dial it
    thread::sleep(Duration::from_millis(100));
    info!(listen = %listen, "broker_started");
    Ok(listen)
}

/// Start the broker if the configuration asks for one
pub fn start_from_config(config: &AppConfig) -> anyhow::Result<Option<SocketAddr>> {
    if !config.broker_embedded() {
        return Ok(None);
    }
    start_embedded_broker(config.broker_bind_address(), config.broker_port()).map(Some)
}
