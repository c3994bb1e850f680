//! Mock Smartbox device
//!
//! Simulates one box on the broker for local testing.
//!
//! Behavior:
//! 1. Subscribes to `smartbox_<name>/cmd`
//! 2. Publishes a reading on `smartbox_<name>/data` every log interval
//! 3. Answers every command with a status report on `smartbox_<name>/status`
//! 4. While a run is active, moves toward the end position at `--speed-mps`
//!
//! Usage:
//!   cargo run --bin mock_device -- --device box01 --lat -6.2 --lng 106.8

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use smartbox_tracker::domain::{Coordinate, DeviceCommand, DeviceCommandStatus, DeviceMode, DeviceReading};
use smartbox_tracker::io::device_wire::DeviceDatumOut;
use smartbox_tracker::io::DeviceTopics;
use smartbox_tracker::services::geofence::distance_m;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "mock_device")]
#[command(about = "Mock Smartbox device for local simulation")]
struct Args {
    /// Broker host
    #[arg(long, default_value = "localhost")]
    broker: String,

    /// Broker port
    #[arg(short, long, default_value = "1883")]
    port: u16,

    /// Device name
    #[arg(short, long, default_value = "box01")]
    device: String,

    /// Starting latitude
    #[arg(long, default_value = "-6.2")]
    lat: f64,

    /// Starting longitude
    #[arg(long, default_value = "106.8")]
    lng: f64,

    /// Travel speed during an active run (m/s)
    #[arg(long, default_value = "10")]
    speed_mps: f64,

    /// Initial log interval (seconds)
    #[arg(long, default_value = "5")]
    interval_secs: u32,

    /// Cabin temperature reported (°C)
    #[arg(long, default_value = "5.0")]
    temp: f64,
}

struct MockBox {
    mode: DeviceMode,
    position: Coordinate,
    end: Option<Coordinate>,
    log_interval_secs: u32,
    door_open_until: Option<Instant>,
    speed_mps: f64,
    temp: f64,
    tick: u64,
}

impl MockBox {
    fn status(&self) -> DeviceCommandStatus {
        DeviceCommandStatus {
            mode: self.mode,
            end_position: self.end,
            log_interval_seconds: Some(self.log_interval_secs),
        }
    }

    /// Apply a command; returns whether the log interval changed
    fn apply(&mut self, command: DeviceCommand) -> bool {
        match command {
            DeviceCommand::Status => false,
            DeviceCommand::Start(end) => {
                self.mode = DeviceMode::Active;
                self.end = Some(end);
                false
            }
            DeviceCommand::End => {
                self.mode = DeviceMode::Idle;
                false
            }
            DeviceCommand::Time(secs) => {
                self.log_interval_secs = secs.max(1);
                true
            }
            DeviceCommand::Door(secs) => {
                self.door_open_until = Some(Instant::now() + Duration::from_secs(u64::from(secs)));
                false
            }
        }
    }

    fn advance(&mut self) {
        self.tick += 1;
        let Some(end) = self.end.filter(|_| self.mode == DeviceMode::Active) else {
            return;
        };
        let remaining = distance_m(&self.position, &end);
        let step = self.speed_mps * f64::from(self.log_interval_secs);
        if remaining <= step || remaining == 0.0 {
            self.position = end;
            return;
        }
        let f = step / remaining;
        let lat = self.position.lat() + (end.lat() - self.position.lat()) * f;
        let lng = self.position.lng() + (end.lng() - self.position.lng()) * f;
        if let Ok(next) = Coordinate::new(lat, lng) {
            self.position = next;
        }
    }

    fn reading(&self) -> DeviceReading {
        let now = Utc::now();
        let door_open = self.door_open_until.is_some_and(|until| Instant::now() < until);
        // Small wobble so charts are not flat
        let wobble = ((self.tick % 10) as f64 - 5.0) * 0.05;
        DeviceReading {
            coordinate: self.position,
            temperature: Some(self.temp + wobble),
            humidity: Some(55.0 - wobble),
            door_open,
            signal: 21,
            speed: Some(if self.mode == DeviceMode::Active { self.speed_mps * 3.6 } else { 0.0 }),
            satellites: Some(9),
            gps_timestamp: now,
            recorded_at: now,
        }
    }
}

/// Queue a publish without waiting; the event loop below is the only poller
fn publish_json<T: serde::Serialize>(client: &AsyncClient, topic: &str, value: &T) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(value)?;
    client.try_publish(topic, QoS::AtLeastOnce, false, payload).context("publish")?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    let topics = DeviceTopics::for_device(&args.device);
    let position = Coordinate::new(args.lat, args.lng).context("starting position")?;

    let client_id = format!("mock-device-{}", Uuid::now_v7().simple());
    let mut options = MqttOptions::new(client_id, args.broker.clone(), args.port);
    options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(options, 64);

    let mut device = MockBox {
        mode: DeviceMode::Idle,
        position,
        end: None,
        log_interval_secs: args.interval_secs.max(1),
        door_open_until: None,
        speed_mps: args.speed_mps,
        temp: args.temp,
        tick: 0,
    };

    info!(device = %args.device, broker = %args.broker, port = args.port, "mock_device_starting");

    let mut interval = tokio::time::interval(Duration::from_secs(u64::from(device.log_interval_secs)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown_signal_received");
                break;
            }
            _ = interval.tick() => {
                device.advance();
                let reading = device.reading();
                debug!(lat = reading.coordinate.lat(), lng = reading.coordinate.lng(), "reading_published");
                if let Err(e) = publish_json(&client, &topics.data, &DeviceDatumOut::from(&reading)) {
                    warn!(error = %e, "reading_publish_failed");
                }
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(topic = %topics.cmd, "mock_device_connected");
                        client.try_subscribe(&topics.cmd, QoS::AtLeastOnce).context("subscribe")?;
                        publish_json(&client, &topics.status, &device.status())?;
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) if p.topic == topics.cmd => {
                        match serde_json::from_slice::<DeviceCommand>(&p.payload) {
                            Ok(command) => {
                                info!(cmd = command.name(), "command_received");
                                if device.apply(command) {
                                    let period = Duration::from_secs(u64::from(device.log_interval_secs));
                                    interval = tokio::time::interval(period);
                                }
                                publish_json(&client, &topics.status, &device.status())?;
                            }
                            Err(e) => warn!(error = %e, "command_malformed"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mock_device_connection_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    client.try_disconnect().ok();
    Ok(())
}
