use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_retry::RetryIf;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::error::{ConnectionError, PublishError};
use crate::models::TelemetryMessage;

const REQUEST_CAPACITY: usize = 10;
const ROUTE_CAPACITY: usize = 256;

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Acknowledgement that the session accepted a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub topic: String,
    pub payload_len: usize,
    pub state: ConnectionState,
}

/// The publishing side of a broker session.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    fn state(&self) -> ConnectionState;

    /// Returns once the link is usable again, or the reconnect budget is spent.
    async fn ensure_connected(&self) -> Result<(), ConnectionError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<Ack, PublishError>;
}

/// Receives every message delivered on a subscribed topic.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, message: TelemetryMessage);
}

struct Route {
    filter: String,
    tx: mpsc::Sender<TelemetryMessage>,
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    routes: StdMutex<Vec<Route>>,
    closing: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Broker session state: {} -> {}", previous, state);
        }
    }

    fn routes(&self) -> MutexGuard<'_, Vec<Route>> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns `false` when the session has already been declared lost.
    fn add_route(&self, filter: &str, tx: mpsc::Sender<TelemetryMessage>) -> bool {
        let mut routes = self.routes();
        if *self.state.borrow() == ConnectionState::Failed {
            return false;
        }
        routes.push(Route {
            filter: filter.to_string(),
            tx,
        });
        true
    }

    fn filters(&self) -> Vec<String> {
        let mut routes = self.routes();
        routes.retain(|route| !route.tx.is_closed());
        routes.iter().map(|route| route.filter.clone()).collect()
    }

    /// Hands a message to every subscriber whose filter matches.
    ///
    /// Runs on the event-loop task, so it never waits: a subscriber whose
    /// queue is full loses the message and the loop keeps polling.
    fn dispatch(&self, message: TelemetryMessage) {
        let targets: Vec<mpsc::Sender<TelemetryMessage>> = self
            .routes()
            .iter()
            .filter(|route| topic_matches(&route.filter, &message.topic))
            .map(|route| route.tx.clone())
            .collect();

        if targets.is_empty() {
            warn!("Unknown topic received: {}", message.topic);
            return;
        }

        for tx in targets {
            match tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Subscriber for '{}' is falling behind, dropping message.",
                        message.topic
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Subscriber for '{}' is gone.", message.topic);
                }
            }
        }
    }

    fn close_routes(&self) {
        self.routes().clear();
    }

    /// Declares the session lost and ends every open subscription.
    fn fail(&self) {
        self.set_state(ConnectionState::Failed);
        self.close_routes();
    }
}

struct Link {
    client: AsyncClient,
    driver: JoinHandle<()>,
}

/// The process-wide connection to the MQTT broker.
///
/// One session is created at startup and shared by every publisher and
/// subscriber. Only the session writes its connection state; a background
/// task drives the MQTT event loop and reconnects with bounded backoff.
pub struct BrokerSession {
    config: BrokerConfig,
    shared: Arc<Shared>,
    link: Mutex<Option<Link>>,
}

impl BrokerSession {
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            config,
            shared: Arc::new(Shared {
                state,
                routes: StdMutex::new(Vec::new()),
                closing: AtomicBool::new(false),
            }),
            link: Mutex::new(None),
        })
    }

    /// Creates the session and connects it, retrying with backoff.
    pub async fn connect(config: BrokerConfig) -> Result<Arc<Self>, ConnectionError> {
        let session = Self::new(config);
        session.start().await?;
        Ok(session)
    }

    pub async fn start(&self) -> Result<(), ConnectionError> {
        info!("Starting MQTT session...");
        let mut link = self.link.lock().await;
        if let Some(old) = link.take() {
            old.driver.abort();
        }
        self.shared.closing.store(false, Ordering::SeqCst);
        *link = Some(self.establish_with_backoff().await?);
        Ok(())
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub async fn ensure_connected(&self) -> Result<(), ConnectionError> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        let mut link = self.link.lock().await;

        let driver_alive = link
            .as_ref()
            .map(|current| !current.driver.is_finished())
            .unwrap_or(false);
        if driver_alive {
            // The event loop is already reconnecting; give it one connect window.
            let mut rx = self.shared.state.subscribe();
            let outcome = timeout(self.config.connect_timeout, async move {
                rx.wait_for(|state| {
                    matches!(state, ConnectionState::Connected | ConnectionState::Failed)
                })
                .await
                .map(|state| *state)
            })
            .await;
            if let Ok(Ok(ConnectionState::Connected)) = outcome {
                return Ok(());
            }
        }

        if let Some(old) = link.take() {
            old.driver.abort();
        }
        info!("Re-establishing MQTT session as '{}'.", self.config.client_id);
        self.shared.closing.store(false, Ordering::SeqCst);
        match self.establish_with_backoff().await {
            Ok(fresh) => {
                *link = Some(fresh);
                Ok(())
            }
            Err(e) => {
                self.shared.fail();
                Err(e)
            }
        }
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<Ack, PublishError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(PublishError::NotConnected { state, cause: None });
        }

        // AsyncClient is a cloneable request queue; the lock only guards the swap.
        let client = match self.link.lock().await.as_ref() {
            Some(link) => link.client.clone(),
            None => {
                return Err(PublishError::NotConnected {
                    state: ConnectionState::Disconnected,
                    cause: None,
                })
            }
        };

        let payload_len = payload.len();
        match timeout(
            self.config.connect_timeout,
            client.publish(topic, self.config.qos, false, payload),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Failed to publish message to '{}': {:?}", topic, e);
                return Err(PublishError::BrokerRejected(e.to_string()));
            }
            Err(_) => {
                error!("Request queue stalled while publishing to '{}'.", topic);
                return Err(PublishError::BrokerRejected(
                    "request queue is full".to_string(),
                ));
            }
        }

        debug!("Message published to '{}' ({} bytes)", topic, payload_len);
        Ok(Ack {
            topic: topic.to_string(),
            payload_len,
            state: self.state(),
        })
    }

    /// Registers a route for `filter` and returns the receiving end.
    ///
    /// The subscription is re-issued to the broker after every reconnect. The
    /// receiver yields `None` once the session is shut down or lost.
    pub async fn open_subscription(
        &self,
        filter: &str,
    ) -> Result<mpsc::Receiver<TelemetryMessage>, ConnectionError> {
        self.ensure_connected().await?;

        let (tx, rx) = mpsc::channel(ROUTE_CAPACITY);
        if !self.shared.add_route(filter, tx) {
            return Err(ConnectionError::SessionLost {
                attempts: self.config.max_retries,
            });
        }

        let link = self.link.lock().await;
        if let Some(link) = link.as_ref() {
            link.client
                .subscribe(filter, self.config.qos)
                .await
                .map_err(|e| ConnectionError::NetworkUnreachable(e.to_string()))?;
        }

        info!("Successfully subscribed to topic '{}'.", filter);
        Ok(rx)
    }

    /// Feeds every message on `filter` to `handler`, one at a time, for as long
    /// as the session lives. Returns `Ok` after a shutdown and an error when
    /// the session was lost for good.
    pub async fn subscribe<H>(&self, filter: &str, handler: &H) -> Result<(), ConnectionError>
    where
        H: MessageHandler + ?Sized,
    {
        let mut subscription = self.open_subscription(filter).await?;

        while let Some(message) = subscription.recv().await {
            handler.on_message(message).await;
        }

        match self.state() {
            ConnectionState::Failed => {
                error!("Subscription to '{}' ended: broker session lost.", filter);
                Err(ConnectionError::SessionLost {
                    attempts: self.config.max_retries,
                })
            }
            _ => {
                info!("Subscription to '{}' closed.", filter);
                Ok(())
            }
        }
    }

    /// Announces `offline`, disconnects and stops the event loop.
    pub async fn shutdown(&self) {
        let mut link = self.link.lock().await;
        let Some(current) = link.take() else {
            return;
        };

        if self.state() == ConnectionState::Connected {
            if let Some(topic) = &self.config.status_topic {
                if let Err(e) = current
                    .client
                    .publish(topic, QoS::AtLeastOnce, true, STATUS_OFFLINE)
                    .await
                {
                    warn!("Failed to publish offline status: {:?}", e);
                }
            }
        }

        self.shared.closing.store(true, Ordering::SeqCst);
        if let Err(e) = current.client.disconnect().await {
            warn!("Failed to send DISCONNECT: {:?}", e);
        }

        let mut driver = current.driver;
        if timeout(self.config.connect_timeout, &mut driver).await.is_err() {
            driver.abort();
        }

        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.close_routes();
        info!("MQTT session '{}' closed.", self.config.client_id);
    }

    async fn establish_with_backoff(&self) -> Result<Link, ConnectionError> {
        RetryIf::spawn(
            self.config.reconnect_delays(),
            || self.establish(),
            |e: &ConnectionError| {
                warn!("Connecting to MQTT broker failed: {}. Retrying...", e);
                e.is_retryable()
            },
        )
        .await
    }

    async fn establish(&self) -> Result<Link, ConnectionError> {
        debug!(
            "Configuring MQTT broker at {}:{}...",
            self.config.host, self.config.port
        );
        self.shared.set_state(ConnectionState::Connecting);

        let mut mqtt_options =
            MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        mqtt_options.set_keep_alive(self.config.keep_alive);
        mqtt_options.set_clean_session(true);

        if self.config.has_credentials() {
            mqtt_options.set_credentials(&self.config.username, &self.config.password);
        }
        if let Some(topic) = &self.config.status_topic {
            mqtt_options.set_last_will(LastWill::new(
                topic,
                STATUS_OFFLINE,
                QoS::AtLeastOnce,
                true,
            ));
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        let connack = match timeout(self.config.connect_timeout, await_connack(&mut eventloop)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        };
        if let Err(e) = connack {
            self.shared.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        info!(
            "Connected to MQTT broker at {}:{} as '{}'.",
            self.config.host, self.config.port, self.config.client_id
        );
        self.shared.set_state(ConnectionState::Connected);

        let driver = tokio::spawn(drive(
            eventloop,
            client.clone(),
            self.shared.clone(),
            self.config.clone(),
        ));
        announce(&client, &self.shared, &self.config);

        Ok(Link { client, driver })
    }
}

impl Drop for BrokerSession {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.driver.abort();
        }
    }
}

#[async_trait]
impl BrokerLink for BrokerSession {
    fn state(&self) -> ConnectionState {
        BrokerSession::state(self)
    }

    async fn ensure_connected(&self) -> Result<(), ConnectionError> {
        BrokerSession::ensure_connected(self).await
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<Ack, PublishError> {
        BrokerSession::publish(self, topic, payload).await
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(event) => debug!("Event before CONNACK: {:?}", event),
            Err(e) => return Err(classify(e)),
        }
    }
}

/// Drives the event loop for the lifetime of one link.
async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    config: BrokerConfig,
) {
    let mut delays = config.reconnect_delays();
    let mut attempts = 0usize;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Reconnected to MQTT broker after {} attempt(s).", attempts);
                delays = config.reconnect_delays();
                attempts = 0;
                shared.set_state(ConnectionState::Connected);
                announce(&client, &shared, &config);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = TelemetryMessage::new(publish.topic, publish.payload.to_vec());
                shared.dispatch(message);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) if shared.closing.load(Ordering::SeqCst) => {
                debug!("DISCONNECT sent, stopping event loop.");
                return;
            }
            Ok(event) => debug!("Unhandled event: {:?}", event),
            Err(_) if shared.closing.load(Ordering::SeqCst) => return,
            Err(e) => {
                let reason = classify(e);
                shared.set_state(ConnectionState::Disconnected);

                let next = if reason.is_retryable() { delays.next() } else { None };
                match next {
                    Some(delay) => {
                        attempts += 1;
                        warn!(
                            "Lost connection to MQTT broker ({}). Retrying in {:?}...",
                            reason, delay
                        );
                        sleep(delay).await;
                        shared.set_state(ConnectionState::Connecting);
                    }
                    None => {
                        error!(
                            "Giving up on MQTT broker after {} attempt(s): {}",
                            attempts, reason
                        );
                        shared.fail();
                        return;
                    }
                }
            }
        }
    }
}

/// Re-issues subscriptions and the retained `online` status after a CONNACK.
/// Uses the non-blocking client calls because it runs beside the event loop.
fn announce(client: &AsyncClient, shared: &Shared, config: &BrokerConfig) {
    for filter in shared.filters() {
        if let Err(e) = client.try_subscribe(filter.clone(), config.qos) {
            warn!("Failed to re-subscribe to '{}': {:?}", filter, e);
        }
    }
    if let Some(topic) = &config.status_topic {
        if let Err(e) = client.try_publish(topic, QoS::AtLeastOnce, true, STATUS_ONLINE) {
            warn!("Failed to publish online status: {:?}", e);
        }
    }
}

fn classify(err: rumqttc::ConnectionError) -> ConnectionError {
    match err {
        rumqttc::ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                ConnectionError::AuthRejected
            }
            other => ConnectionError::Refused(format!("{:?}", other)),
        },
        rumqttc::ConnectionError::NetworkTimeout => ConnectionError::Timeout,
        other => ConnectionError::NetworkUnreachable(other.to_string()),
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::collections::HashMap;
    use std::time::Duration;

    fn unreachable_config() -> BrokerConfig {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("MQTT_HOST", "127.0.0.1"),
            ("MQTT_PORT", "1"),
            ("MQTT_MAX_RETRIES", "1"),
            ("MQTT_RETRY_INTERVAL_MS", "100"),
            ("MQTT_CONNECT_TIMEOUT_MS", "500"),
        ]);
        Config::from_lookup(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap()
            .broker
    }

    #[test]
    fn topic_filters() {
        assert!(topic_matches("esp32/sensors", "esp32/sensors"));
        assert!(!topic_matches("esp32/sensors", "esp32/led"));
        assert!(topic_matches("esp32/+/telemetry", "esp32/kitchen/telemetry"));
        assert!(!topic_matches("esp32/+/telemetry", "esp32/kitchen/sub/telemetry"));
        assert!(topic_matches("esp32/#", "esp32/kitchen/sub/telemetry"));
        assert!(topic_matches("esp32/#", "esp32"));
        assert!(!topic_matches("esp32/sensors", "esp32/sensors/extra"));
    }

    #[test]
    fn refused_codes_are_classified() {
        assert_eq!(
            classify(rumqttc::ConnectionError::ConnectionRefused(
                ConnectReturnCode::BadUserNamePassword
            )),
            ConnectionError::AuthRejected
        );
        assert_eq!(
            classify(rumqttc::ConnectionError::ConnectionRefused(
                ConnectReturnCode::NotAuthorized
            )),
            ConnectionError::AuthRejected
        );
        assert!(matches!(
            classify(rumqttc::ConnectionError::ConnectionRefused(
                ConnectReturnCode::ServiceUnavailable
            )),
            ConnectionError::Refused(_)
        ));
        assert_eq!(
            classify(rumqttc::ConnectionError::NetworkTimeout),
            ConnectionError::Timeout
        );
        assert!(matches!(
            classify(rumqttc::ConnectionError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused
            ))),
            ConnectionError::NetworkUnreachable(_)
        ));
    }

    #[tokio::test]
    async fn publish_fails_fast_when_disconnected() {
        let session = BrokerSession::new(unreachable_config());
        assert_eq!(session.state(), ConnectionState::Disconnected);

        let result = session.publish("esp32/led", b"1,2,3,4".to_vec()).await;
        assert_eq!(
            result,
            Err(PublishError::NotConnected {
                state: ConnectionState::Disconnected,
                cause: None,
            })
        );
    }

    #[tokio::test]
    async fn connect_gives_up_on_unreachable_broker() {
        let started = std::time::Instant::now();
        let result = BrokerSession::connect(unreachable_config()).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn subscribe_surfaces_connection_failure() {
        struct Ignore;

        #[async_trait]
        impl MessageHandler for Ignore {
            async fn on_message(&self, _message: TelemetryMessage) {}
        }

        let session = BrokerSession::new(unreachable_config());
        let result = session.subscribe("esp32/sensors", &Ignore).await;
        assert!(result.is_err());
        assert_eq!(session.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn dispatch_routes_by_filter() {
        let session = BrokerSession::new(unreachable_config());
        let (tx, mut rx) = mpsc::channel(4);
        assert!(session.shared.add_route("esp32/+", tx));

        session
            .shared
            .dispatch(TelemetryMessage::new("esp32/sensors", b"{}".to_vec()));
        session
            .shared
            .dispatch(TelemetryMessage::new("other/topic", b"{}".to_vec()));

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.topic, "esp32/sensors");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn busy_subscriber_does_not_block_dispatch() {
        let session = BrokerSession::new(unreachable_config());
        let (tx, mut rx) = mpsc::channel(1);
        assert!(session.shared.add_route("esp32/sensors", tx));

        session
            .shared
            .dispatch(TelemetryMessage::new("esp32/sensors", b"first".to_vec()));
        session
            .shared
            .dispatch(TelemetryMessage::new("esp32/sensors", b"second".to_vec()));

        assert_eq!(rx.recv().await.unwrap().raw_payload, b"first".to_vec());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_reconnect_ends_open_subscriptions() {
        let session = BrokerSession::new(unreachable_config());
        let (tx, mut rx) = mpsc::channel(4);
        assert!(session.shared.add_route("esp32/sensors", tx));

        // A driver that is still reconnecting and never gets anywhere.
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("stuck", "127.0.0.1", 1), 1);
        *session.link.lock().await = Some(Link {
            client,
            driver: tokio::spawn(std::future::pending::<()>()),
        });
        session.shared.set_state(ConnectionState::Connecting);

        assert!(session.ensure_connected().await.is_err());
        assert_eq!(session.state(), ConnectionState::Failed);

        let ended = timeout(Duration::from_secs(3), rx.recv()).await;
        assert!(matches!(ended, Ok(None)));

        // A late subscriber is turned away instead of waiting forever.
        let (late, _late_rx) = mpsc::channel(1);
        assert!(!session.shared.add_route("esp32/sensors", late));
    }

    #[tokio::test]
    async fn exhausted_reconnects_fault_the_consumer() {
        use crate::telemetry::{ConsumerState, TelemetryConsumer, TelemetryDecoder};
        use crate::testing::FakeStore;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let session = BrokerSession::new(unreachable_config());
        let (client, eventloop) =
            AsyncClient::new(MqttOptions::new("exhausted", "127.0.0.1", port), REQUEST_CAPACITY);
        let driver = tokio::spawn(drive(
            eventloop,
            client.clone(),
            session.shared.clone(),
            session.config.clone(),
        ));
        *session.link.lock().await = Some(Link { client, driver });
        session.shared.set_state(ConnectionState::Connected);

        let consumer = Arc::new(TelemetryConsumer::new(
            TelemetryDecoder::new(vec!["sensor_id".to_string()]),
            FakeStore::new(),
        ));
        let running = {
            let session = session.clone();
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run(&session, "esp32/sensors").await })
        };

        timeout(Duration::from_secs(3), async {
            while session.shared.filters().is_empty() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Drop the broker: the live connection closes and reconnects are refused.
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);
        drop(listener);

        let result = timeout(Duration::from_secs(10), running).await.unwrap().unwrap();
        assert!(matches!(result, Err(ConnectionError::SessionLost { .. })));
        assert_eq!(session.state(), ConnectionState::Failed);
        assert_eq!(consumer.state(), ConsumerState::Faulted);
    }

    #[tokio::test]
    async fn stalled_request_queue_does_not_hang_publish() {
        let session = BrokerSession::new(unreachable_config());
        // Nothing polls this event loop, so its one-slot queue fills up.
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("stalled", "127.0.0.1", 1), 1);
        *session.link.lock().await = Some(Link {
            client,
            driver: tokio::spawn(std::future::pending::<()>()),
        });
        session.shared.set_state(ConnectionState::Connected);

        assert!(session.publish("esp32/led", b"1,2,3,4".to_vec()).await.is_ok());
        let stalled = timeout(
            Duration::from_secs(3),
            session.publish("esp32/led", b"5,6,7,8".to_vec()),
        )
        .await
        .unwrap();
        assert!(matches!(stalled, Err(PublishError::BrokerRejected(_))));

        // The link lock was not held across the stall.
        assert!(session.link.try_lock().is_ok());
    }

    #[test]
    fn state_labels() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Failed.to_string(), "failed");
    }
}
