//! # MQTT link
//!
//! Owns the broker session. Outbound messages go through [`Publisher`];
//! inbound messages are dispatched to routes registered by topic filter.
//! The operator mode request is parsed here and handed on as a [`Mode`].
//!
//! Connection state feeds the `mqtt_offline` checker through
//! [`LinkStatus`]. Sixty seconds without any inbound packet count as a
//! dead session: the link marks itself disconnected and asks the event
//! loop to drop the connection, which then reconnects.

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::topics::topic_matches;
use super::{IoError, Publisher, Qos, Topics};
use crate::config::MqttConfig;
use crate::controller::checkers::LinkStatus;
use crate::domain::Mode;
use crate::hardware::{Sink, SinkList};

/// Interval between PINGREQs when nothing else is sent
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Inbound silence after which the session is considered dead
pub const INBOUND_SILENCE: Duration = Duration::from_secs(60);
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 64;

/// Inbound message: (topic, payload)
pub type Inbound = (String, Vec<u8>);

#[derive(Debug)]
struct LinkState {
    connected: bool,
    disconnected_since: Option<Instant>,
    last_inbound: Instant,
}

pub struct MqttLink {
    client: AsyncClient,
    topics: Topics,
    live_topic: Option<String>,
    state: Mutex<LinkState>,
    routes: Mutex<Vec<(String, Sink<Inbound>)>>,
    modes: SinkList<Mode>,
    reconnects: SinkList<()>,
}

fn qos(q: Qos) -> QoS {
    match q {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

/// rumqttc pings after one keep-alive period of outbound silence, so the
/// advertised keep-alive is the ping interval. Dead sessions are detected
/// locally through [`INBOUND_SILENCE`].
fn options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    options.set_keep_alive(PING_INTERVAL);
    options.set_clean_start(true);
    if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        options.set_credentials(user.clone(), pass.clone());
    }
    options
}

impl MqttLink {
    /// Builds the client; the returned event loop is driven by [`MqttLink::run`].
    pub fn new(config: &MqttConfig, now: Instant) -> (Arc<Self>, EventLoop) {
        let (client, eventloop) = AsyncClient::new(options(config), REQUEST_CAPACITY);
        let link = Arc::new(Self {
            client,
            topics: Topics::new(config.root.clone()),
            live_topic: config.live_consumption_topic.clone(),
            state: Mutex::new(LinkState {
                connected: false,
                disconnected_since: Some(now),
                last_inbound: now,
            }),
            routes: Mutex::new(Vec::new()),
            modes: SinkList::new(),
            reconnects: SinkList::new(),
        });
        (link, eventloop)
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Delivers inbound messages whose topic matches `filter`
    pub fn route(&self, filter: impl Into<String>, sink: Sink<Inbound>) {
        self.routes.lock().push((filter.into(), sink));
    }

    /// Operator mode requests from `{root}/mode/set`
    pub fn subscribe_modes(&self, sink: Sink<Mode>) {
        self.modes.subscribe(sink);
    }

    /// Fired after every successful (re)connect
    pub fn subscribe_reconnects(&self, sink: Sink<()>) {
        self.reconnects.subscribe(sink);
    }

    fn filters(&self) -> Vec<String> {
        let mut filters = vec![self.topics.mode_set(), self.topics.battery_forward_filter()];
        filters.extend(self.live_topic.clone());
        filters
    }

    fn on_connected(&self, now: Instant) {
        {
            let mut state = self.state.lock();
            state.connected = true;
            state.disconnected_since = None;
            state.last_inbound = now;
        }
        for filter in self.filters() {
            if let Err(e) = self.client.try_subscribe(filter.clone(), QoS::AtMostOnce) {
                warn!(topic = %filter, error = %e, "subscribe failed");
            }
        }
        info!("mqtt connected");
        self.reconnects.emit(());
    }

    fn on_disconnected(&self, now: Instant) {
        let mut state = self.state.lock();
        if state.connected {
            warn!("mqtt disconnected");
        }
        state.connected = false;
        state.disconnected_since.get_or_insert(now);
    }

    fn note_inbound(&self, now: Instant) {
        self.state.lock().last_inbound = now;
    }

    /// True when a connected session has been silent for [`INBOUND_SILENCE`]
    fn silent(&self, now: Instant) -> bool {
        let state = self.state.lock();
        state.connected && now.saturating_duration_since(state.last_inbound) >= INBOUND_SILENCE
    }

    fn silence_deadline(&self) -> Instant {
        self.state.lock().last_inbound + INBOUND_SILENCE
    }

    /// Hands an inbound message to the mode sinks or the matching routes
    pub fn dispatch(&self, topic: &str, payload: &[u8]) {
        if topic == self.topics.mode_set() {
            match std::str::from_utf8(payload).ok().map(|s| Mode::from_str(s.trim())) {
                Some(Ok(mode)) => self.modes.emit(mode),
                _ => warn!(payload = %String::from_utf8_lossy(payload), "ignoring invalid mode request"),
            }
            return;
        }
        let sinks: Vec<Sink<Inbound>> = self
            .routes
            .lock()
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, sink)| sink.clone())
            .collect();
        if sinks.is_empty() {
            debug!(topic, "no route for inbound message");
        }
        for sink in sinks {
            sink((topic.to_string(), payload.to_vec()));
        }
    }

    fn handle(&self, event: Event, now: Instant) {
        let Event::Incoming(packet) = event else {
            return;
        };
        self.note_inbound(now);
        match packet {
            Packet::ConnAck(_) => self.on_connected(now),
            Packet::Publish(publish) => match std::str::from_utf8(&publish.topic) {
                Ok(topic) => self.dispatch(topic, &publish.payload),
                Err(_) => warn!("inbound publish with non utf-8 topic"),
            },
            Packet::Disconnect(_) => self.on_disconnected(now),
            _ => {}
        }
    }

    /// Drives the event loop until `cancel` fires, then sends a best-effort DISCONNECT.
    pub async fn run(self: Arc<Self>, mut eventloop: EventLoop, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(self.silence_deadline()), if self.is_connected() => {
                    let now = Instant::now();
                    if self.silent(now) {
                        warn!(after = ?INBOUND_SILENCE, "no inbound traffic, dropping session");
                        self.on_disconnected(now);
                        if let Err(e) = self.client.try_disconnect() {
                            debug!(error = %e, "disconnect request failed");
                        }
                    }
                }
                polled = eventloop.poll() => match polled {
                    Ok(event) => self.handle(event, Instant::now()),
                    Err(e) => {
                        warn!(error = %e, "mqtt connection error");
                        self.on_disconnected(Instant::now());
                        tokio::time::sleep(RECONNECT_PAUSE).await;
                    }
                },
            }
        }

        if self.is_connected() {
            if let Err(e) = self.client.try_disconnect() {
                debug!(error = %e, "disconnect request failed");
            }
            // let the event loop write the DISCONNECT
            let _ = tokio::time::timeout(RECONNECT_PAUSE, eventloop.poll()).await;
        }
        self.on_disconnected(Instant::now());
        info!("mqtt link stopped");
    }
}

#[async_trait]
impl Publisher for MqttLink {
    async fn publish(&self, topic: String, payload: Vec<u8>, q: Qos) -> Result<(), IoError> {
        if !self.is_connected() {
            return Err(IoError::NotConnected);
        }
        self.client
            .publish(topic.clone(), qos(q), false, payload)
            .await
            .map_err(|e| IoError::Publish {
                topic,
                reason: e.to_string(),
            })
    }
}

impl LinkStatus for MqttLink {
    fn disconnected_since(&self) -> Option<Instant> {
        self.state.lock().disconnected_since
    }
}
