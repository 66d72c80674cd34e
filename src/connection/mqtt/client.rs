//! Impure I/O operations for the MQTT connection
//!
//! This module owns the rumqttc client and event loop. A supervisor task polls
//! the event loop, tracks connection state, backs off between failed polls
//! (rumqttc re-dials on the next poll) and dispatches connect and message
//! events to the registered listeners.

use super::event_router::{route_mqtt_event, EventRoute};
use super::options::{
    configure_mqtt_options, ConnectionEvent, ConnectionState, MqttError, ReconnectConfig,
    ReconnectionDecision,
};
use crate::config::MqttSection;
use crate::connection::{
    ConnectHandler, Connection, ListenerId, ListenerRegistry, MessageHandler, PublishCallback,
    PublishOptions, QoS, TransportError,
};
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// MQTT v5 implementation of [`Connection`]
pub struct MqttConnection {
    client: AsyncClient,
    listeners: Arc<ListenerRegistry>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
    pending_subscriptions: Arc<AtomicUsize>,
    runtime: Handle,
}

impl MqttConnection {
    /// Create the client and start the event loop supervisor on the current runtime
    ///
    /// Returns immediately; the connection reports `Connected` and notifies
    /// connect listeners once the broker acknowledges.
    pub async fn new(
        config: &MqttSection,
        reconnect_config: ReconnectConfig,
    ) -> Result<Arc<Self>, MqttError> {
        let mqtt_options = configure_mqtt_options(config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        let listeners = Arc::new(ListenerRegistry::new());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let state_tx = Arc::new(state_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(broker = %config.broker_url, "Starting MQTT event loop");
        let handle = tokio::spawn(Self::run_event_loop(
            event_loop,
            listeners.clone(),
            state_tx.clone(),
            shutdown_rx,
            reconnect_config,
        ));

        Ok(Arc::new(MqttConnection {
            client,
            listeners,
            state_tx,
            state_rx,
            shutdown_tx,
            event_loop_handle: Mutex::new(Some(handle)),
            pending_subscriptions: Arc::new(AtomicUsize::new(0)),
            runtime: Handle::current(),
        }))
    }

    async fn run_event_loop(
        mut event_loop: EventLoop,
        listeners: Arc<ListenerRegistry>,
        state_tx: Arc<watch::Sender<ConnectionState>>,
        mut shutdown_rx: watch::Receiver<bool>,
        reconnect_config: ReconnectConfig,
    ) {
        let mut reconnect_attempts = 0u32;

        loop {
            tokio::select! {
                // Check for shutdown signal first (higher priority)
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping MQTT event loop");
                        break;
                    }
                }

                event_result = event_loop.poll() => {
                    match event_result {
                        Ok(event) => {
                            Self::process_event_route(
                                route_mqtt_event(&event),
                                &listeners,
                                &state_tx,
                                &mut reconnect_attempts,
                            );
                        }
                        Err(e) => {
                            let _ = state_tx.send(ConnectionState::on_event(
                                ConnectionEvent::NetworkError(e.to_string()),
                            ));
                            if !Self::back_off(
                                &reconnect_config,
                                &state_tx,
                                &mut reconnect_attempts,
                                shutdown_rx.clone(),
                            )
                            .await
                            {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("MQTT event loop stopped");
    }

    /// Apply a routed event: update state and notify listeners
    fn process_event_route(
        route: EventRoute,
        listeners: &ListenerRegistry,
        state_tx: &watch::Sender<ConnectionState>,
        reconnect_attempts: &mut u32,
    ) {
        match route {
            EventRoute::ConnectionAcknowledged => {
                *reconnect_attempts = 0;
                // State first, so listeners observe is_connected() == true
                let _ = state_tx.send(ConnectionState::on_event(ConnectionEvent::ConnAckReceived));
                listeners.dispatch_connect();
            }
            EventRoute::MessageReceived(message) => {
                debug!(
                    target: "mqtt_transport",
                    "Received MQTT message on topic: {}", message.topic
                );
                listeners.dispatch_message(&message);
            }
            EventRoute::Disconnected => {
                let _ = state_tx.send(ConnectionState::on_event(
                    ConnectionEvent::DisconnectedByBroker,
                ));
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                reason_codes,
            } => {
                debug!(
                    target: "mqtt_transport",
                    "Subscription {} confirmed: {}", packet_id, reason_codes
                );
            }
            EventRoute::InfrastructureEvent(event_str) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
            }
            EventRoute::OutgoingEvent => {}
        }
    }

    /// Wait before the next poll; returns false when the loop should end
    async fn back_off(
        reconnect_config: &ReconnectConfig,
        state_tx: &watch::Sender<ConnectionState>,
        reconnect_attempts: &mut u32,
        shutdown_rx: watch::Receiver<bool>,
    ) -> bool {
        let decision = reconnect_config.decide(*reconnect_attempts, *shutdown_rx.borrow());

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                *reconnect_attempts = attempt;
                let _ = state_tx.send(ConnectionState::on_event(
                    ConnectionEvent::ReconnectionStarted(attempt),
                ));

                let max_display = reconnect_config
                    .max_attempts
                    .map_or("∞".to_string(), |max| max.to_string());
                info!(
                    "Attempting reconnection {}/{} after {}ms delay",
                    attempt, max_display, delay_ms
                );

                Self::interruptible_sleep(shutdown_rx, delay_ms).await
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "Max reconnection attempts ({}) exceeded",
                    reconnect_config.max_attempts.unwrap_or_default()
                );
                let _ = state_tx.send(ConnectionState::on_event(
                    ConnectionEvent::PermanentFailure(reason),
                ));
                false
            }
        }
    }

    /// Perform interruptible sleep with shutdown monitoring
    /// Returns true if sleep completed, false if shutdown requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Wait until the broker acknowledges the connection
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), MqttError> {
        let mut state_rx = self.state_rx.clone();
        let wait = async {
            loop {
                match &*state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::PermanentlyDisconnected(reason) => {
                        return Err(MqttError::ConnectionFailedStr(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Get current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Check if the connection is permanently disconnected
    pub fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            ConnectionState::PermanentlyDisconnected(_)
        )
    }

    /// Number of registered (connect, message) listeners
    pub fn listener_counts(&self) -> (usize, usize) {
        self.listeners.counts()
    }

    /// Subscribe requests still waiting for room in the request queue
    pub fn pending_subscriptions(&self) -> usize {
        self.pending_subscriptions.load(Ordering::SeqCst)
    }

    /// Check connection state before operations
    fn check_connection_state(&self) -> Result<(), MqttError> {
        let current_state = self.connection_state();
        if !current_state.is_usable() {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }
        Ok(())
    }

    /// Gracefully disconnect: stop the supervisor, send DISCONNECT, wait briefly
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        // Queue DISCONNECT while the event loop is still polling
        if self.connection_state().is_usable() {
            self.client
                .disconnect()
                .await
                .map_err(|e| MqttError::ConnectionFailed(Box::new(e)))?;
        }

        let _ = self.shutdown_tx.send(true);
        info!("Sent shutdown signal to MQTT event loop");

        let handle = self
            .event_loop_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let abort_handle = handle.abort_handle();
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => info!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!("Event loop task ended with error: {}", e);
                }
                Err(_) => {
                    warn!("Event loop task didn't shut down gracefully, forcing abort");
                    abort_handle.abort();
                }
                _ => {}
            }
        }

        // Written after the supervisor stopped so it cannot be overwritten
        let _ = self
            .state_tx
            .send(ConnectionState::on_event(ConnectionEvent::ClosedLocally));
        info!("MQTT connection closed");
        Ok(())
    }
}

impl Connection for MqttConnection {
    fn is_connected(&self) -> bool {
        self.connection_state().is_usable()
    }

    fn on_connect(&self, handler: ConnectHandler) -> ListenerId {
        self.listeners.add_connect(handler)
    }

    fn on_message(&self, handler: MessageHandler) -> ListenerId {
        self.listeners.add_message(handler)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Queue a SUBSCRIBE without blocking the caller
    ///
    /// The request waits for room in the request queue instead of failing
    /// when it is full, so a resubscribe on ConnAck is never dropped.
    fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        let client = self.client.clone();
        let pending = self.pending_subscriptions.clone();
        let span = crate::mqtt_span!(operation = "subscribe", topic = %filter);
        let filter = filter.to_string();

        pending.fetch_add(1, Ordering::SeqCst);
        self.runtime.spawn(
            async move {
                match client.subscribe(filter.clone(), qos.into()).await {
                    Ok(()) => debug!(
                        target: "mqtt_transport",
                        "Subscribe queued: {} ({:?})", filter, qos
                    ),
                    Err(e) => error!(
                        target: "mqtt_transport",
                        "Failed to queue subscribe to {}: {}", filter, e
                    ),
                }
                pending.fetch_sub(1, Ordering::SeqCst);
            }
            .instrument(span),
        );
        Ok(())
    }

    fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.client
            .try_unsubscribe(filter)
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;
        debug!(target: "mqtt_transport", "Unsubscribe requested: {}", filter);
        Ok(())
    }

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
        on_complete: PublishCallback,
    ) {
        if let Err(e) = self.check_connection_state() {
            on_complete(Err(e.into()));
            return;
        }

        let client = self.client.clone();
        let span = crate::mqtt_span!(operation = "publish", topic = %topic);
        let topic = topic.to_string();
        self.runtime.spawn(
            async move {
                let result: Result<(), TransportError> = client
                    .publish(topic, options.qos.into(), options.retain, payload)
                    .await
                    .map_err(|e| MqttError::PublishFailed(Box::new(e)).into());
                on_complete(result);
            }
            .instrument(span),
        );
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        // Signal shutdown to background tasks if they're still running
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self
            .event_loop_handle
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}
