//! Smartbox tracker - operator console for smart parcel boxes
//!
//! Two modes, each with its own device connection:
//! - device test (default): drive a box through a test run from stdin
//! - tracking (`--parcel <id>`): follow a parcel's lifecycle, pump its
//!   device telemetry into the local trail and advance stages from stdin
//!
//! Module structure:
//! - `domain/` - Parcels, telemetry, value types
//! - `io/` - Device channel (MQTT), wire codecs, persistence client
//! - `services/` - Lifecycle machine, geofence, safety, telemetry store
//! - `infra/` - Config, metrics, embedded broker

use anyhow::Context;
use clap::Parser;
use smartbox_tracker::domain::{Coordinate, DeviceCommand, Parcel, ParcelId, UserId};
use smartbox_tracker::infra::{broker, Config, Metrics};
use smartbox_tracker::io::{ChannelOptions, DeviceChannel, DeviceEvent, DeviceSession, HttpParcelRemote};
use smartbox_tracker::services::{
    DeviceTestSession, LifecycleMachine, LifecycleSettings, Poller, SessionGateway, TelemetryPump, TelemetryStore,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Smartbox tracker - device test and parcel tracking console
#[derive(Parser, Debug)]
#[command(name = "smartbox-tracker", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,

    /// Broker host, overrides the configuration
    #[arg(long)]
    broker: Option<String>,

    /// Broker port, overrides the configuration
    #[arg(long)]
    port: Option<u16>,

    /// Device name; topics are smartbox_<name>/...
    #[arg(long)]
    device: Option<String>,

    /// Start an in-process broker before connecting
    #[arg(long)]
    embedded_broker: bool,

    /// Track this parcel instead of running a device test
    #[arg(long)]
    parcel: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug to see every reading
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    info!(git_hash = env!("GIT_HASH"), "smartbox-tracker starting");

    let config = apply_overrides(Config::load_from_path(&args.config), &args);
    info!(
        config_file = %config.config_file(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        device = %config.device_name(),
        remote = %config.remote_base_url(),
        embedded_broker = %config.broker_embedded(),
        "config_loaded"
    );

    if let Some(addr) = broker::start_from_config(&config)? {
        info!(addr = %addr, "embedded_broker_ready");
    }

    let parcel_id: Option<ParcelId> =
        args.parcel.as_deref().map(str::parse::<ParcelId>).transpose().context("parsing --parcel")?;

    let metrics = Arc::new(Metrics::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    // Handle shutdown on Ctrl+C
    let shutdown_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        shutdown_signal.send_replace(true);
    });

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    let outcome = match parcel_id {
        Some(parcel_id) => run_tracking(&config, metrics.clone(), parcel_id, shutdown_tx.clone()).await,
        None => {
            let (session, events) = connect_device(&config, config.device_name(), metrics.clone()).await?;
            let outcome = run_device_test(&config, &session, events, shutdown_rx).await;
            session.disconnect().await;
            outcome
        }
    };

    shutdown_tx.send_replace(true);
    metrics.report().log();
    info!("smartbox-tracker shutdown complete");
    outcome
}

fn apply_overrides(mut config: Config, args: &Args) -> Config {
    if args.broker.is_some() || args.port.is_some() {
        let host = args.broker.clone().unwrap_or_else(|| config.mqtt_host().to_string());
        let port = args.port.unwrap_or_else(|| config.mqtt_port());
        config = config.with_mqtt_endpoint(host, port);
    }
    if let Some(device) = &args.device {
        config = config.with_device_name(device.clone());
    }
    if args.embedded_broker {
        config = config.with_embedded_broker(true);
    }
    config
}

async fn publish(session: &DeviceSession, command: DeviceCommand) {
    let cmd = command.name();
    match session.publish(&command).await {
        Ok(()) => info!(device = %session.device_name(), cmd, "command_published"),
        Err(e) => warn!(device = %session.device_name(), cmd, error = %e, "command_publish_failed"),
    }
}

/// Operator input in device test mode
#[derive(Debug, PartialEq)]
enum TestInput {
    Status,
    Start(Option<Coordinate>),
    End,
    Time(u32),
    Door(u32),
    Clear(Coordinate),
    Quit,
}

fn parse_coordinate(lat: Option<&str>, lng: Option<&str>) -> Result<Coordinate, String> {
    let (Some(lat), Some(lng)) = (lat, lng) else {
        return Err("expected <lat> <lng>".into());
    };
    let lat: f64 = lat.parse().map_err(|_| format!("bad latitude {lat}"))?;
    let lng: f64 = lng.parse().map_err(|_| format!("bad longitude {lng}"))?;
    Coordinate::new(lat, lng).map_err(|e| e.to_string())
}

fn parse_secs(arg: Option<&str>) -> Result<u32, String> {
    arg.ok_or("expected <seconds>")?.parse().map_err(|_| "seconds must be a whole number".to_string())
}

fn parse_test_input(line: &str) -> Result<TestInput, String> {
    let mut words = line.split_whitespace();
    match words.next() {
        Some("status") => Ok(TestInput::Status),
        Some("start") => match words.next() {
            None => Ok(TestInput::Start(None)),
            lat => parse_coordinate(lat, words.next()).map(|c| TestInput::Start(Some(c))),
        },
        Some("end") => Ok(TestInput::End),
        Some("time") => parse_secs(words.next()).map(TestInput::Time),
        Some("door") => parse_secs(words.next()).map(TestInput::Door),
        Some("clear") => parse_coordinate(words.next(), words.next()).map(TestInput::Clear),
        Some("quit") | Some("exit") => Ok(TestInput::Quit),
        Some(other) => Err(format!("unknown command {other}")),
        None => Err("empty line".into()),
    }
}

async fn connect_device(
    config: &Config,
    device_name: &str,
    metrics: Arc<Metrics>,
) -> anyhow::Result<(DeviceSession, mpsc::Receiver<DeviceEvent>)> {
    DeviceChannel::connect(ChannelOptions::from_config(config), device_name, metrics)
        .await
        .with_context(|| format!("connecting to {}:{} as {device_name}", config.mqtt_host(), config.mqtt_port()))
}

/// Device whose telemetry belongs to `parcel`
fn tracked_device(parcel: &Parcel) -> anyhow::Result<&str> {
    parcel
        .device
        .as_ref()
        .map(|device| device.name.as_str())
        .with_context(|| format!("parcel {} has no device bound", parcel.id))
}

async fn run_device_test(
    config: &Config,
    session: &DeviceSession,
    mut events: mpsc::Receiver<DeviceEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut test = DeviceTestSession::new(config.device_test_radius_m());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("commands: status | start [<lat> <lng>] | end | time <s> | door <s> | clear <lat> <lng> | quit");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if let Some(command) = test.apply_event(event) {
                    publish(session, command).await;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let input = match parse_test_input(&line) {
                    Ok(TestInput::Quit) => break,
                    Ok(input) => input,
                    Err(reason) => {
                        warn!(input = %line.trim(), reason = %reason, "input_rejected");
                        continue;
                    }
                };
                let outcome = match input {
                    TestInput::Status => Ok(DeviceCommand::Status),
                    TestInput::Start(Some(marker)) => test.clear(marker).and_then(|()| test.start()),
                    TestInput::Start(None) => test.start(),
                    TestInput::End => test.end(),
                    TestInput::Time(secs) => test.set_log_interval(secs),
                    TestInput::Door(secs) => test.open_door(secs),
                    TestInput::Clear(position) => {
                        match test.clear(position) {
                            Ok(()) => info!(marker = %position, "test_run_cleared"),
                            Err(e) => warn!(error = %e, "command_refused"),
                        }
                        continue;
                    }
                    TestInput::Quit => break,
                };
                match outcome {
                    Ok(command) => publish(session, command).await,
                    Err(e) => warn!(error = %e, "command_refused"),
                }
            }
        }
    }
    info!(readings = test.readings().len(), on_the_way = test.on_the_way(), "device_test_finished");
    Ok(())
}

/// Operator input in tracking mode
#[derive(Debug, PartialEq)]
enum TrackInput {
    Advance,
    SendCode(UserId),
    Verify(String),
    Open,
    Close,
    Safety,
    Where,
    Quit,
}

fn parse_track_input(line: &str) -> Result<TrackInput, String> {
    let mut words = line.split_whitespace();
    match (words.next(), words.next()) {
        (Some("advance"), None) => Ok(TrackInput::Advance),
        (Some("send-code"), Some(user)) => Ok(TrackInput::SendCode(UserId(user.to_string()))),
        (Some("verify"), Some(code)) => Ok(TrackInput::Verify(code.to_string())),
        (Some("open"), None) => Ok(TrackInput::Open),
        (Some("close"), None) => Ok(TrackInput::Close),
        (Some("safety"), None) => Ok(TrackInput::Safety),
        (Some("where"), None) => Ok(TrackInput::Where),
        (Some("quit") | Some("exit"), None) => Ok(TrackInput::Quit),
        (Some(other), _) => Err(format!("unknown or malformed command {other}")),
        (None, _) => Err("empty line".into()),
    }
}

async fn run_tracking(
    config: &Config,
    metrics: Arc<Metrics>,
    parcel_id: ParcelId,
    shutdown_tx: Arc<watch::Sender<bool>>,
) -> anyhow::Result<()> {
    let remote = Arc::new(HttpParcelRemote::from_config(config).context("building persistence client")?);
    let gateway = Arc::new(SessionGateway::new());
    let store = Arc::new(TelemetryStore::new());
    let machine = Arc::new(LifecycleMachine::new(
        remote,
        gateway.clone(),
        store.clone(),
        metrics.clone(),
        LifecycleSettings::from_config(config),
    ));

    let parcel = machine.load(&parcel_id).await.with_context(|| format!("loading parcel {parcel_id}"))?;
    info!(parcel_id = %parcel.id, name = %parcel.name, status = %parcel.status, "parcel_loaded");

    let device_name = tracked_device(&parcel)?;
    if device_name != config.device_name() {
        info!(parcel_id = %parcel_id, device = %device_name, configured = %config.device_name(), "using_parcel_device");
    }
    let (session, events) = connect_device(config, device_name, metrics.clone()).await?;
    let session = Arc::new(session);
    gateway.register(session.clone());
    if let Err(e) = machine.sync_trail(&parcel_id).await {
        warn!(parcel_id = %parcel_id, error = %e, "trail_sync_failed");
    }

    let pump = TelemetryPump::new(parcel_id.clone(), store, metrics);
    let pump_task = tokio::spawn(pump.run(events, shutdown_tx.subscribe()));
    let poller = Poller::spawn(
        machine.clone(),
        parcel_id.clone(),
        config.parcel_poll_interval(),
        config.travel_poll_interval(),
        shutdown_tx.subscribe(),
    );

    let mut shutdown = shutdown_tx.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("commands: advance | send-code <user> | verify <code> | open | close | safety | where | quit");

    loop {
        let line = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            line = lines.next_line() => line.context("reading stdin")?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let input = match parse_track_input(&line) {
            Ok(TrackInput::Quit) => break,
            Ok(input) => input,
            Err(reason) => {
                warn!(input = %line.trim(), reason = %reason, "input_rejected");
                continue;
            }
        };

        let outcome = match input {
            TrackInput::Advance => machine.advance_stage(&parcel_id).await.map(|t| {
                info!(from = %t.from, to = %t.to(), command_error = ?t.command_error, "transition_applied");
            }),
            TrackInput::SendCode(user) => machine.send_code(&parcel_id, &user).await,
            TrackInput::Verify(code) => machine.verify_code(&parcel_id, &code).await.map(|t| {
                info!(from = %t.from, to = %t.to(), command_error = ?t.command_error, "transition_applied");
            }),
            TrackInput::Open => machine.open_door(&parcel_id).await,
            TrackInput::Close => machine.close_door(&parcel_id).await,
            TrackInput::Safety => machine.safety_report(&parcel_id).await.map(|report| {
                info!(temperature = ?report.temperature, humidity = ?report.humidity, safe = report.is_safe(), "safety_report");
            }),
            TrackInput::Where => machine.has_reached_destination(&parcel_id).await.map(|arrived| {
                let latest = machine.store().latest(&parcel_id).map(|s| s.coordinate.to_string());
                info!(arrived, latest = ?latest, samples = machine.store().len(&parcel_id), "parcel_position");
            }),
            TrackInput::Quit => break,
        };
        if let Err(e) = outcome {
            warn!(parcel_id = %parcel_id, error = %e, "operation_failed");
        }
    }

    shutdown_tx.send_replace(true);
    let _ = pump_task.await;
    let _ = poller.await;
    session.disconnect().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use smartbox_tracker::domain::{Device, DeviceMode, UserRef};

    #[test]
    fn test_parse_test_input() {
        assert_eq!(parse_test_input("status"), Ok(TestInput::Status));
        assert_eq!(parse_test_input("start"), Ok(TestInput::Start(None)));
        assert_eq!(
            parse_test_input("start -6.2 106.8"),
            Ok(TestInput::Start(Some(Coordinate::new(-6.2, 106.8).unwrap())))
        );
        assert_eq!(parse_test_input("door 5"), Ok(TestInput::Door(5)));
        assert!(parse_test_input("time -1").is_err());
        assert!(parse_test_input("clear 91 0").is_err());
        assert!(parse_test_input("start 1").is_err());
    }

    #[test]
    fn test_parse_track_input() {
        assert_eq!(parse_track_input("verify 123456"), Ok(TrackInput::Verify("123456".into())));
        assert_eq!(parse_track_input("send-code u2"), Ok(TrackInput::SendCode(UserId("u2".into()))));
        assert!(parse_track_input("send-code").is_err());
        assert!(parse_track_input("advance now").is_err());
    }

    #[test]
    fn test_tracked_device_comes_from_parcel() {
        let id: ParcelId = "64b7f0c2a1d3e4f5a6b7c8d9".parse().unwrap();
        let mut parcel = Parcel::draft(id, UserRef::new("u1", "Sari"));
        assert!(tracked_device(&parcel).is_err());

        parcel.device = Some(Device {
            id: "aaaaaaaaaaaaaaaaaaaaaaaa".parse().unwrap(),
            name: "box07".into(),
            status: DeviceMode::Active,
        });
        assert_eq!(tracked_device(&parcel).unwrap(), "box07");
    }
}
