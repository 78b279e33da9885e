use crate::domain::MessageHandler;
use crate::mqtt::{ConnectionEvent, ConnectionState, ReconnectBackoff};
use common::domain::InboundMessage;
use futures::FutureExt;
use rumqttc::{
    AsyncClient, ClientError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Capacity of the request channel between the client handle and the event loop
const REQUEST_CHANNEL_CAPACITY: usize = 100;

/// How long to keep polling after shutdown so the DISCONNECT packet goes out
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MqttSubscriberConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_filters: Vec<String>,
    pub qos: QoS,
    pub keep_alive: Duration,
    pub reconnect_min_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Messages inside the handler at once
    pub max_in_flight_messages: usize,
    /// Messages accepted but not finished, running ones included. Deliveries
    /// beyond this are dropped.
    pub max_pending_messages: usize,
}

impl MqttSubscriberConfig {
    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.clone().unwrap_or_default());
        }
        options
    }
}

/// Where subscription requests go; the broker client in production
pub trait SubscriptionSink {
    fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), ClientError>;
}

impl SubscriptionSink for AsyncClient {
    /// `try_subscribe` only enqueues, so this never waits on the event loop
    /// that is calling it.
    fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), ClientError> {
        self.try_subscribe(filter, qos)
    }
}

/// Owns the broker subscription and feeds every delivered message to the
/// handler.
///
/// The event loop only receives and dispatches; each message runs in its own
/// task so slow storage never stalls keep-alives or reconnects. At most
/// `max_in_flight_messages` messages are inside the handler at once and at
/// most `max_pending_messages` are held in memory.
pub struct IngestionCoordinator {
    config: MqttSubscriberConfig,
    handler: Arc<dyn MessageHandler>,
    state: ConnectionState,
    backoff: ReconnectBackoff,
    in_flight: Arc<Semaphore>,
    pending: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl IngestionCoordinator {
    pub fn new(config: MqttSubscriberConfig, handler: Arc<dyn MessageHandler>) -> Self {
        let in_flight = config.max_in_flight_messages.max(1);
        let pending = config.max_pending_messages.max(in_flight);
        Self {
            backoff: ReconnectBackoff::new(config.reconnect_min_delay, config.reconnect_max_delay),
            config,
            handler,
            state: ConnectionState::Disconnected,
            in_flight: Arc::new(Semaphore::new(in_flight)),
            pending: Arc::new(Semaphore::new(pending)),
            tracker: TaskTracker::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Run until `ctx` is cancelled. Transport failures never end the loop.
    ///
    /// On cancellation the client disconnects, stops accepting messages and
    /// waits for in-flight messages to finish before returning.
    #[instrument(
        name = "mqtt_subscriber",
        skip_all,
        fields(
            broker = %format!("{}:{}", self.config.host, self.config.port),
            client_id = %self.config.client_id,
        )
    )]
    pub async fn run(mut self, ctx: CancellationToken) -> anyhow::Result<()> {
        let (client, mut eventloop) =
            AsyncClient::new(self.config.mqtt_options(), REQUEST_CHANNEL_CAPACITY);

        info!(
            topics = ?self.config.topic_filters,
            max_in_flight = self.config.max_in_flight_messages,
            max_pending = self.config.max_pending_messages,
            "starting MQTT subscriber"
        );
        self.on_connection_event(ConnectionEvent::Start, &client);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    debug!("shutdown signal received");
                    break;
                }
                event = eventloop.poll() => match event {
                    Ok(event) => self.handle_event(event, &client),
                    Err(err) => {
                        let delay = self.on_transport_error();
                        warn!(
                            error = %err,
                            delay_ms = delay.as_millis() as u64,
                            "MQTT connection error, reconnecting"
                        );
                        tokio::select! {
                            _ = ctx.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        self.shutdown(&client, &mut eventloop).await;
        Ok(())
    }

    /// React to one event from the broker connection
    pub fn handle_event<S: SubscriptionSink>(&mut self, event: Event, sink: &S) {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                self.backoff.reset();
                self.on_connection_event(ConnectionEvent::ConnAck, sink);
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let message = InboundMessage::new(publish.topic, publish.payload.to_vec());
                self.dispatch(message);
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                let rejected = ack
                    .return_codes
                    .iter()
                    .any(|code| *code == SubscribeReasonCode::Failure);
                if rejected {
                    warn!(
                        pkid = ack.pkid,
                        codes = ?ack.return_codes,
                        "broker rejected a subscription"
                    );
                } else {
                    debug!(pkid = ack.pkid, "subscription acknowledged");
                }
            }
            _ => {}
        }
    }

    /// Record a lost connection and return how long to wait before polling again
    pub fn on_transport_error(&mut self) -> Duration {
        self.transition(ConnectionEvent::TransportError);
        self.backoff.next_delay()
    }

    fn on_connection_event<S: SubscriptionSink>(&mut self, event: ConnectionEvent, sink: &S) {
        self.transition(event);
        if ConnectionState::requires_subscribe(event) {
            self.subscribe_all(sink);
        }
    }

    fn transition(&mut self, event: ConnectionEvent) {
        let next = self.state.on(event);
        if next != self.state {
            info!(from = %self.state, to = %next, "MQTT connection state changed");
        }
        self.state = next;
    }

    fn subscribe_all<S: SubscriptionSink>(&self, sink: &S) {
        for filter in &self.config.topic_filters {
            match sink.subscribe(filter, self.config.qos) {
                Ok(()) => info!(topic = %filter, qos = ?self.config.qos, "subscribing"),
                Err(err) => error!(topic = %filter, error = %err, "failed to queue subscription"),
            }
        }
    }

    /// Hand `message` to the handler on its own task.
    ///
    /// Returns `false` and drops the message when `max_pending_messages` are
    /// already held. A panic inside the handler is caught and logged here so
    /// it can never reach the event loop.
    pub fn dispatch(&self, message: InboundMessage) -> bool {
        let Ok(pending_permit) = Arc::clone(&self.pending).try_acquire_owned() else {
            error!(
                topic = %message.topic,
                raw_payload = %message.raw_lossy(),
                max_pending = self.config.max_pending_messages,
                "message backlog full, dropping message"
            );
            return false;
        };

        let handler = Arc::clone(&self.handler);
        let in_flight = Arc::clone(&self.in_flight);

        self.tracker.spawn(async move {
            let _pending_permit = pending_permit;
            let Ok(_permit) = in_flight.acquire_owned().await else {
                return;
            };

            let outcome = AssertUnwindSafe(async { handler.handle(&message).await })
                .catch_unwind()
                .await;

            if let Err(panic) = outcome {
                error!(
                    topic = %message.topic,
                    raw_payload = %message.raw_lossy(),
                    panic = %panic_message(panic.as_ref()),
                    "message handler panicked"
                );
            }
        });
        true
    }

    /// Number of dispatched messages that have not finished yet
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    async fn shutdown(&mut self, client: &AsyncClient, eventloop: &mut EventLoop) {
        if self.state == ConnectionState::Subscribed {
            if let Err(err) = client.try_disconnect() {
                warn!(error = %err, "failed to queue MQTT disconnect");
            } else {
                let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
                    loop {
                        match eventloop.poll().await {
                            Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                            Ok(_) => {}
                        }
                    }
                })
                .await;
                if flushed.is_err() {
                    warn!("timed out sending MQTT disconnect");
                }
            }
        }
        self.transition(ConnectionEvent::Shutdown);

        self.tracker.close();
        info!(in_flight = self.tracker.len(), "waiting for in-flight messages");
        self.tracker.wait().await;
        info!("MQTT subscriber stopped");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MockMessageHandler;
    use rumqttc::{ConnAck, ConnectReturnCode, Publish};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn test_config(max_in_flight_messages: usize) -> MqttSubscriberConfig {
        MqttSubscriberConfig {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "fieldlink-test".to_string(),
            username: None,
            password: None,
            topic_filters: vec!["channels/+/publish".to_string()],
            qos: QoS::AtLeastOnce,
            keep_alive: Duration::from_secs(60),
            reconnect_min_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_in_flight_messages,
            max_pending_messages: 100,
        }
    }

    /// Records every subscription request instead of sending it
    #[derive(Default)]
    struct RecordingSink {
        requests: Mutex<Vec<(String, QoS)>>,
    }

    impl RecordingSink {
        fn filters(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|(filter, _)| filter.clone())
                .collect()
        }
    }

    impl SubscriptionSink for RecordingSink {
        fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), ClientError> {
            self.requests.lock().unwrap().push((filter.to_string(), qos));
            Ok(())
        }
    }

    fn connack() -> Event {
        Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }))
    }

    async fn drain(coordinator: &IngestionCoordinator) {
        coordinator.tracker.close();
        coordinator.tracker.wait().await;
    }

    #[tokio::test]
    async fn test_dispatch_delivers_message_to_handler() {
        let mut handler = MockMessageHandler::new();
        handler
            .expect_handle()
            .withf(|message: &InboundMessage| {
                message.topic == "channels/7/publish" && message.raw == b"rssi=-70"
            })
            .times(1)
            .returning(|_| ());

        let coordinator = IngestionCoordinator::new(test_config(4), Arc::new(handler));
        coordinator.dispatch(InboundMessage::new("channels/7/publish", b"rssi=-70".to_vec()));

        drain(&coordinator).await;
        assert_eq!(coordinator.in_flight(), 0);
    }

    /// Panics on payloads equal to `boom`, counts everything else
    struct FlakyHandler {
        handled: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MessageHandler for FlakyHandler {
        async fn handle(&self, message: &InboundMessage) {
            if message.raw == b"boom" {
                panic!("parser bug");
            }
            self.handled.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_panicking_message_does_not_affect_the_next_one() {
        let handler = Arc::new(FlakyHandler {
            handled: AtomicUsize::new(0),
        });

        let coordinator = IngestionCoordinator::new(test_config(1), handler.clone());
        coordinator.dispatch(InboundMessage::new("a/b", b"boom".to_vec()));
        coordinator.dispatch(InboundMessage::new("a/b", b"fine".to_vec()));
        coordinator.dispatch(InboundMessage::new("a/b", b"also fine".to_vec()));

        drain(&coordinator).await;
        assert_eq!(handler.handled.load(Ordering::SeqCst), 2);
    }

    /// Holds every message until `gate` receives permits
    struct BlockingHandler {
        gate: Semaphore,
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MessageHandler for BlockingHandler {
        async fn handle(&self, _message: &InboundMessage) {
            self.started.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_backlog_is_capped_while_storage_is_stuck() {
        let handler = Arc::new(BlockingHandler {
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        });
        let mut config = test_config(2);
        config.max_pending_messages = 5;
        let coordinator = IngestionCoordinator::new(config, handler.clone());

        let accepted = (0..1000)
            .map(|i| {
                coordinator.dispatch(InboundMessage::new("a/b", format!("rssi=-{i}").into_bytes()))
            })
            .filter(|accepted| *accepted)
            .count();

        assert_eq!(accepted, 5);
        assert_eq!(coordinator.in_flight(), 5);

        // Let the spawned tasks reach the handler
        while handler.started.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(handler.started.load(Ordering::SeqCst), 2);

        handler.gate.add_permits(1000);
        drain(&coordinator).await;
        assert_eq!(handler.finished.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_backlog_frees_up_once_messages_finish() {
        let mut handler = MockMessageHandler::new();
        handler.expect_handle().times(3).returning(|_| ());
        let mut config = test_config(1);
        config.max_pending_messages = 1;
        let coordinator = IngestionCoordinator::new(config, Arc::new(handler));

        for _ in 0..3 {
            assert!(coordinator.dispatch(InboundMessage::new("a/b", b"rssi=-1".to_vec())));
            while coordinator.in_flight() > 0 {
                tokio::task::yield_now().await;
            }
        }
        drain(&coordinator).await;
    }

    #[tokio::test]
    async fn test_every_connack_reissues_all_subscriptions() {
        let mut config = test_config(1);
        config.topic_filters = vec!["channels/+/publish".to_string(), "esp32/#".to_string()];
        let mut coordinator =
            IngestionCoordinator::new(config, Arc::new(MockMessageHandler::new()));
        let sink = RecordingSink::default();

        coordinator.on_connection_event(ConnectionEvent::Start, &sink);
        assert!(sink.filters().is_empty());

        coordinator.handle_event(connack(), &sink);
        assert_eq!(coordinator.state(), ConnectionState::Subscribed);
        assert_eq!(sink.filters(), vec!["channels/+/publish", "esp32/#"]);

        coordinator.on_transport_error();
        assert_eq!(coordinator.state(), ConnectionState::Reconnecting);
        coordinator.handle_event(connack(), &sink);

        assert_eq!(coordinator.state(), ConnectionState::Subscribed);
        assert_eq!(
            sink.filters(),
            vec![
                "channels/+/publish",
                "esp32/#",
                "channels/+/publish",
                "esp32/#"
            ]
        );
        assert!(sink
            .requests
            .lock()
            .unwrap()
            .iter()
            .all(|(_, qos)| *qos == QoS::AtLeastOnce));
    }

    #[tokio::test]
    async fn test_non_connack_events_do_not_subscribe() {
        let mut handler = MockMessageHandler::new();
        handler.expect_handle().times(1).returning(|_| ());
        let mut coordinator = IngestionCoordinator::new(test_config(1), Arc::new(handler));
        let sink = RecordingSink::default();

        coordinator.on_connection_event(ConnectionEvent::Start, &sink);
        coordinator.handle_event(Event::Incoming(Packet::PingResp), &sink);
        coordinator.handle_event(
            Event::Incoming(Packet::Publish(Publish::new(
                "channels/7/publish",
                QoS::AtLeastOnce,
                b"rssi=-70".to_vec(),
            ))),
            &sink,
        );
        coordinator.on_transport_error();

        assert!(sink.filters().is_empty());
        drain(&coordinator).await;
    }

    #[tokio::test]
    async fn test_connack_resets_reconnect_backoff() {
        let mut config = test_config(1);
        config.reconnect_min_delay = Duration::from_secs(1);
        config.reconnect_max_delay = Duration::from_secs(30);
        let mut coordinator =
            IngestionCoordinator::new(config, Arc::new(MockMessageHandler::new()));
        let sink = RecordingSink::default();

        assert_eq!(coordinator.on_transport_error(), Duration::from_secs(1));
        assert_eq!(coordinator.on_transport_error(), Duration::from_secs(2));
        assert_eq!(coordinator.on_transport_error(), Duration::from_secs(4));

        coordinator.handle_event(connack(), &sink);
        assert_eq!(coordinator.on_transport_error(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_new_coordinator_starts_disconnected() {
        let coordinator =
            IngestionCoordinator::new(test_config(0), Arc::new(MockMessageHandler::new()));
        assert_eq!(coordinator.state(), ConnectionState::Disconnected);
        assert_eq!(coordinator.in_flight.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_run_returns_promptly_when_cancelled_while_broker_is_unreachable() {
        let mut config = test_config(1);
        // Nothing listens here, so every poll fails and the coordinator backs off
        config.host = "127.0.0.1".to_string();
        config.port = 1;
        config.reconnect_min_delay = Duration::from_millis(10);
        config.reconnect_max_delay = Duration::from_millis(50);
        let coordinator = IngestionCoordinator::new(config, Arc::new(MockMessageHandler::new()));

        let ctx = CancellationToken::new();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        tokio::time::timeout(Duration::from_secs(10), coordinator.run(ctx))
            .await
            .expect("coordinator did not stop")
            .unwrap();
    }

    #[test]
    fn test_panic_message_extracts_text() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(boxed.as_ref()), "static str");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");

        let boxed: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
