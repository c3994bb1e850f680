//! MQTT device channel: one broker connection per tracking device
//!
//! `DeviceChannel::connect` dials the broker, waits for the first CONNACK and
//! then hands the rumqttc event loop to a dedicated task. Inbound messages are
//! decoded and posted to a bounded queue with `try_send`, so a slow consumer
//! never stalls the event loop. Dropped events are counted in metrics and
//! logged (rate-limited). The latest connection state is also kept on a
//! `watch` channel.

use crate::domain::telemetry::{DeviceCommand, DeviceCommandStatus, DeviceReading};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::device_wire::{decode_reading, decode_status, encode_command, DeviceTopics, TopicKind};
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeFilter,
    SubscribeReasonCode,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bound on flushing the outgoing DISCONNECT packet
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);
/// Bound on waiting for the connection task to exit before aborting it
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Capacity of the rumqttc request channel
const REQUEST_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("broker connection failed: {0}")]
    Connect(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("device channel is not connected")]
    NotConnected,
    #[error("device channel is closed")]
    Closed,
    #[error("command encoding failed: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for ChannelError {
    fn from(e: serde_json::Error) -> Self {
        ChannelError::Encode(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected and subscribed to both inbound topics
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    State(ConnectionState),
    Data(DeviceReading),
    Status(DeviceCommandStatus),
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub host: String,
    pub port: u16,
    pub client_id_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    pub queue_capacity: usize,
}

impl ChannelOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id_prefix: "smartbox-tracker".to_string(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_millis(4000),
            reconnect_interval: Duration::from_millis(1000),
            queue_capacity: 1000,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.mqtt_host().to_string(),
            port: config.mqtt_port(),
            client_id_prefix: config.mqtt_client_id().to_string(),
            username: config.mqtt_username().map(str::to_string),
            password: config.mqtt_password().map(str::to_string),
            keep_alive: config.mqtt_keep_alive(),
            connect_timeout: config.mqtt_connect_timeout(),
            reconnect_interval: config.mqtt_reconnect_interval(),
            queue_capacity: config.event_queue_capacity(),
        }
    }

    fn mqtt_options(&self) -> MqttOptions {
        let client_id = format!("{}-{}", self.client_id_prefix, Uuid::now_v7().simple());
        let mut mqttoptions = MqttOptions::new(client_id, self.host.clone(), self.port);
        mqttoptions.set_keep_alive(self.keep_alive);
        mqttoptions.set_clean_session(true);
        if let Some(username) = &self.username {
            mqttoptions.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }
        mqttoptions
    }
}

pub struct DeviceChannel;

impl DeviceChannel {
    /// Connect to the broker for `device_name`.
    ///
    /// Resolves once the broker acknowledged the connection; the subscription
    /// completes in the background and flips the state to `Connected`.
    pub async fn connect(
        options: ChannelOptions,
        device_name: &str,
        metrics: Arc<Metrics>,
    ) -> Result<(DeviceSession, mpsc::Receiver<DeviceEvent>), ChannelError> {
        if device_name.trim().is_empty() {
            return Err(ChannelError::Connect("empty device name".to_string()));
        }

        let topics = DeviceTopics::for_device(device_name);
        let (client, mut eventloop) = AsyncClient::new(options.mqtt_options(), REQUEST_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(options.queue_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut driver = ConnectionDriver::new(
            device_name.to_string(),
            client.clone(),
            topics.clone(),
            state_tx,
            event_tx,
            metrics.clone(),
            options.reconnect_interval,
        );
        driver.set_state(ConnectionState::Connecting);

        let first = tokio::time::timeout(options.connect_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(packet @ Packet::ConnAck(_))) => {
                        driver.handle_packet(packet);
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(e) => return Err(e),
                }
            }
        })
        .await;

        match first {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                driver.set_state(ConnectionState::Disconnected);
                warn!(device = %device_name, host = %options.host, port = %options.port, error = %e, "device_connect_failed");
                return Err(ChannelError::Connect(e.to_string()));
            }
            Err(_) => {
                driver.set_state(ConnectionState::Disconnected);
                warn!(device = %device_name, host = %options.host, port = %options.port, "device_connect_timeout");
                return Err(ChannelError::Connect(format!(
                    "no CONNACK within {} ms",
                    options.connect_timeout.as_millis()
                )));
            }
        }

        info!(device = %device_name, host = %options.host, port = %options.port, "device_connected");
        let task = tokio::spawn(driver.run(eventloop, shutdown_rx));

        let session = DeviceSession {
            client,
            topics,
            device_name: device_name.to_string(),
            state_rx,
            shutdown_tx,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
            metrics,
        };
        Ok((session, event_rx))
    }
}

/// Handle to one device connection. Owned by its caller; dropping it aborts
/// the connection task.
pub struct DeviceSession {
    client: AsyncClient,
    topics: DeviceTopics,
    device_name: String,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    metrics: Arc<Metrics>,
}

impl DeviceSession {
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn topics(&self) -> &DeviceTopics {
        &self.topics
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Wait until the connection reaches `target`, up to `timeout`
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.state_rx.clone();
        let reached = matches!(tokio::time::timeout(timeout, rx.wait_for(|s| *s == target)).await, Ok(Ok(_)));
        reached
    }

    /// Publish a command on the cmd topic at QoS 1.
    ///
    /// Refused with `NotConnected` unless the session is connected and
    /// subscribed; nothing is queued for later delivery.
    pub async fn publish(&self, command: &DeviceCommand) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }

        let state = self.state();
        if state != ConnectionState::Connected {
            self.metrics.record_publish_failure();
            warn!(device = %self.device_name, cmd = command.name(), state = %state, "device_publish_refused");
            return Err(ChannelError::NotConnected);
        }

        let payload = encode_command(command)?;
        if let Err(e) = self
            .client
            .publish(self.topics.cmd.clone(), QoS::AtLeastOnce, false, payload)
            .await
        {
            self.metrics.record_publish_failure();
            warn!(device = %self.device_name, cmd = command.name(), error = %e, "device_publish_failed");
            return Err(ChannelError::Publish(e.to_string()));
        }

        self.metrics.record_publish();
        debug!(device = %self.device_name, cmd = command.name(), "device_command_published");
        Ok(())
    }

    /// Unsubscribe, send DISCONNECT and stop the connection task. Idempotent.
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for topic in [&self.topics.data, &self.topics.status] {
            if let Err(e) = self.client.try_unsubscribe(topic.as_str()) {
                debug!(device = %self.device_name, topic = %topic, error = %e, "device_unsubscribe_skipped");
            }
        }
        if let Err(e) = self.client.try_disconnect() {
            debug!(device = %self.device_name, error = %e, "device_disconnect_request_skipped");
        }
        let _ = self.shutdown_tx.send(true);

        let task = self.task.lock().take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(DISCONNECT_TIMEOUT, task).await.is_err() {
                abort.abort();
                warn!(device = %self.device_name, "device_disconnect_timeout");
            }
        }
        info!(device = %self.device_name, "device_disconnected");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Owns the event loop side of a session
struct ConnectionDriver {
    device_name: String,
    client: AsyncClient,
    topics: DeviceTopics,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: mpsc::Sender<DeviceEvent>,
    metrics: Arc<Metrics>,
    reconnect_interval: Duration,
    last_drop_warn: Instant,
}

impl ConnectionDriver {
    fn new(
        device_name: String,
        client: AsyncClient,
        topics: DeviceTopics,
        state_tx: watch::Sender<ConnectionState>,
        event_tx: mpsc::Sender<DeviceEvent>,
        metrics: Arc<Metrics>,
        reconnect_interval: Duration,
    ) -> Self {
        Self {
            device_name,
            client,
            topics,
            state_tx,
            event_tx,
            metrics,
            reconnect_interval,
            // Rate-limit drop warnings to 1 per second
            last_drop_warn: Instant::now() - Duration::from_secs(2),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Publish a state change. Repeating the current state is a no-op.
    fn set_state(&mut self, next: ConnectionState) {
        if self.state() == next {
            return;
        }
        self.state_tx.send_replace(next);
        debug!(device = %self.device_name, state = %next, "device_state_changed");
        self.post(DeviceEvent::State(next));
    }

    fn post(&mut self, event: DeviceEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics.record_queue_full();
                if self.last_drop_warn.elapsed() > Duration::from_secs(1) {
                    warn!(device = %self.device_name, "device_event_dropped: channel full");
                    self.last_drop_warn = Instant::now();
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!(device = %self.device_name, "device_event_receiver_closed");
            }
        }
    }

    fn subscribe(&self) {
        let filters = vec![
            SubscribeFilter::new(self.topics.data.clone(), QoS::AtMostOnce),
            SubscribeFilter::new(self.topics.status.clone(), QoS::AtMostOnce),
        ];
        if let Err(e) = self.client.try_subscribe_many(filters) {
            error!(device = %self.device_name, error = %e, "device_subscribe_request_failed");
        }
    }

    fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::ConnAck(_) => {
                // Clean session: subscriptions do not survive a reconnect
                self.subscribe();
            }
            Packet::SubAck(suback) => {
                let accepted = suback
                    .return_codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
                if accepted {
                    self.set_state(ConnectionState::Connected);
                } else {
                    error!(device = %self.device_name, codes = ?suback.return_codes, "device_subscribe_rejected");
                }
            }
            Packet::Publish(publish) => {
                self.metrics.record_message_received();
                match self.topics.classify(&publish.topic) {
                    Some(TopicKind::Data) => match decode_reading(&publish.payload) {
                        Ok(reading) => {
                            self.metrics.record_reading();
                            self.post(DeviceEvent::Data(reading));
                        }
                        Err(e) => {
                            self.metrics.record_malformed();
                            warn!(device = %self.device_name, topic = %publish.topic, error = %e, "device_data_malformed");
                        }
                    },
                    Some(TopicKind::Status) => match decode_status(&publish.payload) {
                        Ok(status) => {
                            self.metrics.record_status();
                            self.post(DeviceEvent::Status(status));
                        }
                        Err(e) => {
                            self.metrics.record_malformed();
                            warn!(device = %self.device_name, topic = %publish.topic, error = %e, "device_status_malformed");
                        }
                    },
                    None => {
                        debug!(device = %self.device_name, topic = %publish.topic, "device_unexpected_topic");
                    }
                }
            }
            _ => {}
        }
    }

    async fn flush_disconnect(&self, eventloop: &mut EventLoop) {
        let flush = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, flush).await.is_err() {
            debug!(device = %self.device_name, "device_disconnect_flush_timeout");
        }
    }

    async fn run(mut self, mut eventloop: EventLoop, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                if self.state() == ConnectionState::Connected {
                    self.flush_disconnect(&mut eventloop).await;
                }
                self.set_state(ConnectionState::Disconnected);
                info!(device = %self.device_name, "device_channel_shutdown");
                return;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Session dropped without disconnect
                        self.set_state(ConnectionState::Disconnected);
                        return;
                    }
                }
                result = eventloop.poll() => {
                    match result {
                        Ok(Event::Incoming(packet)) => self.handle_packet(packet),
                        Ok(Event::Outgoing(_)) => {}
                        Err(e) => {
                            self.metrics.record_reconnect();
                            warn!(device = %self.device_name, error = %e, retry_ms = %self.reconnect_interval.as_millis(), "device_connection_lost");
                            self.set_state(ConnectionState::Disconnected);

                            // Fixed interval, interrupted by shutdown
                            tokio::select! {
                                _ = tokio::time::sleep(self.reconnect_interval) => {}
                                _ = shutdown.changed() => {}
                            }
                            if !*shutdown.borrow() {
                                self.set_state(ConnectionState::Connecting);
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::parcel::DeviceMode;
    use rumqttc::{ConnAck, ConnectReturnCode, Publish, SubAck};

    struct Harness {
        driver: ConnectionDriver,
        state_rx: watch::Receiver<ConnectionState>,
        event_rx: mpsc::Receiver<DeviceEvent>,
        metrics: Arc<Metrics>,
        _eventloop: EventLoop,
    }

    fn harness(capacity: usize) -> Harness {
        let (client, eventloop) =
            AsyncClient::new(MqttOptions::new("test", "localhost", 1883), REQUEST_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let metrics = Arc::new(Metrics::new());
        let mut driver = ConnectionDriver::new(
            "box01".to_string(),
            client,
            DeviceTopics::for_device("box01"),
            state_tx,
            event_tx,
            metrics.clone(),
            Duration::from_millis(10),
        );
        driver.set_state(ConnectionState::Connecting);
        Harness { driver, state_rx, event_rx, metrics, _eventloop: eventloop }
    }

    fn suback_ok() -> Packet {
        Packet::SubAck(SubAck::new(
            1,
            vec![SubscribeReasonCode::Success(QoS::AtMostOnce), SubscribeReasonCode::Success(QoS::AtMostOnce)],
        ))
    }

    fn drain(rx: &mut mpsc::Receiver<DeviceEvent>) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_suback_connects_once() {
        let mut h = harness(16);
        h.driver.handle_packet(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false)));
        h.driver.handle_packet(suback_ok());
        h.driver.handle_packet(suback_ok());

        assert_eq!(*h.state_rx.borrow(), ConnectionState::Connected);
        let states: Vec<_> = drain(&mut h.event_rx)
            .into_iter()
            .filter_map(|e| match e {
                DeviceEvent::State(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![ConnectionState::Connecting, ConnectionState::Connected]);
    }

    #[test]
    fn test_suback_failure_stays_connecting() {
        let mut h = harness(16);
        h.driver.handle_packet(Packet::SubAck(SubAck::new(
            1,
            vec![SubscribeReasonCode::Success(QoS::AtMostOnce), SubscribeReasonCode::Failure],
        )));
        assert_eq!(*h.state_rx.borrow(), ConnectionState::Connecting);
    }

    #[test]
    fn test_routes_status_and_drops_malformed() {
        let mut h = harness(16);
        h.driver.handle_packet(suback_ok());
        drain(&mut h.event_rx);

        h.driver.handle_packet(Packet::Publish(Publish::new(
            "smartbox_box01/status",
            QoS::AtMostOnce,
            r#"{"mode": 1, "endPosition": {"lat": 1.0, "lng": 2.0}, "logInterval": 30}"#,
        )));
        h.driver.handle_packet(Packet::Publish(Publish::new(
            "smartbox_box01/status",
            QoS::AtMostOnce,
            r#"{"mode": 1, "endPosition": {"lat": "x", "lng": 2.0}}"#,
        )));
        h.driver.handle_packet(Packet::Publish(Publish::new(
            "smartbox_box01/data",
            QoS::AtMostOnce,
            "not json",
        )));

        let events = drain(&mut h.event_rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            DeviceEvent::Status(status) => {
                assert_eq!(status.mode, DeviceMode::Active);
                assert_eq!(status.log_interval_seconds, Some(30));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(h.metrics.malformed_dropped(), 2);
        assert_eq!(*h.state_rx.borrow(), ConnectionState::Connected);
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let mut h = harness(1);
        // Connecting state event already fills the queue
        h.driver.handle_packet(Packet::Publish(Publish::new(
            "smartbox_box01/status",
            QoS::AtMostOnce,
            r#"{"mode": 0}"#,
        )));
        assert_eq!(h.metrics.queue_full_dropped(), 1);
        assert_eq!(drain(&mut h.event_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_fails() {
        let (client, _eventloop) =
            AsyncClient::new(MqttOptions::new("test", "localhost", 1883), REQUEST_CAPACITY);
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(Metrics::new());
        let session = DeviceSession {
            client,
            topics: DeviceTopics::for_device("box01"),
            device_name: "box01".to_string(),
            state_rx,
            shutdown_tx,
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
            metrics: metrics.clone(),
        };

        let err = session.publish(&DeviceCommand::Status).await.unwrap_err();
        assert_eq!(err, ChannelError::NotConnected);
        assert_eq!(metrics.publish_failures(), 1);

        session.disconnect().await;
        session.disconnect().await;
        assert!(session.is_closed());
        assert_eq!(session.publish(&DeviceCommand::End).await.unwrap_err(), ChannelError::Closed);
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_device() {
        let result =
            DeviceChannel::connect(ChannelOptions::new("localhost", 1), " ", Arc::new(Metrics::new())).await;
        assert!(matches!(result, Err(ChannelError::Connect(_))));
    }

    #[tokio::test]
    async fn test_connect_unreachable_broker_fails() {
        let mut options = ChannelOptions::new("127.0.0.1", 1);
        options.connect_timeout = Duration::from_millis(500);
        let result = DeviceChannel::connect(options, "box01", Arc::new(Metrics::new())).await;
        assert!(matches!(result, Err(ChannelError::Connect(_))));
    }
}
