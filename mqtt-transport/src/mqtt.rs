//! MQTT implementation of [`Transport`] on top of rumqttc.
//!
//! A single connection task owns the rumqttc event loop. It:
//! - dispatches inbound publishes through the [`HandlerRouter`]
//! - re-subscribes every registered filter after each CONNACK and only
//!   reports `Connected` once all SUBACKs have arrived
//! - waits out the backoff schedule between reconnect attempts
//! - stops on shutdown, on refused credentials, or when attempts run out

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::backoff::Backoff;
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::message::{InboundMessage, Qos};
use crate::router::{HandlerRouter, MessageHandler};
use crate::state::ConnectionState;
use crate::topic::TopicFilter;
use crate::transport::Transport;

/// MQTT connection with automatic reconnect and topic routing.
pub struct MqttTransport {
    client: AsyncClient,
    router: HandlerRouter,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    connection_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Connect to the broker described by `config`.
    ///
    /// Returns once the first CONNACK has been received. Fails with
    /// `Connection` when the broker is unreachable, refuses the session, or
    /// does not answer within `config.connect_timeout`.
    pub async fn connect(config: TransportConfig) -> Result<Self> {
        config.validate()?;

        let client_id = config.effective_client_id();
        let mut options = MqttOptions::new(&client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(config.clean_session);
        if let Some((username, password)) = &config.credentials {
            options.set_credentials(username, password);
        }
        match &config.tls {
            Some(tls) => {
                options.set_transport(tls.transport()?);
            }
            None if config.port == 8883 => {
                tracing::warn!("Port 8883 is normally MQTT over TLS; use an mqtts:// address to enable TLS");
            }
            None => {}
        }

        let (client, eventloop) = AsyncClient::new(options, config.request_channel_capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = oneshot::channel();
        let router = HandlerRouter::new();

        tracing::info!(
            "Connecting to MQTT broker {}:{} as {} ({})",
            config.host,
            config.port,
            client_id,
            if config.tls.is_some() { "tls" } else { "tcp" }
        );

        let kernel = ConnectionKernel {
            client: client.clone(),
            eventloop,
            router: router.clone(),
            state_tx,
            backoff: config.backoff(),
            handshake: None,
            ready: Some(ready_tx),
        };
        let connection_task = tokio::spawn(kernel.run(shutdown_rx));

        let outcome = match timeout(config.connect_timeout, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Connection(
                "connection task exited before the handshake completed".to_string(),
            )),
            Err(_) => Err(TransportError::Connection(format!(
                "no CONNACK from {}:{} within {:?}",
                config.host, config.port, config.connect_timeout
            ))),
        };

        if let Err(e) = outcome {
            connection_task.abort();
            return Err(e);
        }

        Ok(Self {
            client,
            router,
            state_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            connection_task: Mutex::new(Some(connection_task)),
        })
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.router.len()
    }
}

#[async_trait]
impl Transport for MqttTransport {
    /// `Ok` means the message was accepted into the client's outgoing queue.
    /// Delivery at QoS 1 is then retried by rumqttc until the broker sends
    /// PUBACK, including across reconnects; the PUBACK itself is not awaited.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<()> {
        if !self.state_rx.borrow().is_connected() {
            return Err(TransportError::NotConnected);
        }

        self.client
            .publish(topic, qos.into(), false, payload)
            .await
            .map_err(TransportError::from)?;

        tracing::debug!("Published to {}", topic);
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        qos: Qos,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let filter = TopicFilter::new(filter)?;
        self.router.register(filter.clone(), qos, handler);

        // Always queued: rumqttc holds requests while the connection is down,
        // and a re-subscribe snapshot taken before the route existed misses it.
        self.client
            .subscribe(filter.as_str(), qos.into())
            .await
            .map_err(|e| TransportError::Subscribe {
                filter: filter.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!("Subscribed to {}", filter);
        Ok(())
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    async fn shutdown(&self) -> Result<()> {
        let shutdown_tx = self.shutdown_tx.lock().take();
        if let Some(shutdown_tx) = shutdown_tx {
            let _ = shutdown_tx.send(()).await;
        }

        let task = self.connection_task.lock().take();
        if let Some(task) = task {
            match timeout(Duration::from_secs(5), task).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(TransportError::Shutdown(format!(
                    "Connection task panicked: {e}"
                ))),
                Err(_) => Err(TransportError::Shutdown(
                    "Connection task shutdown timed out after 5 seconds".to_string(),
                )),
            }
        } else {
            Ok(())
        }
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(task) = self.connection_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Owns the event loop for the lifetime of the connection.
struct ConnectionKernel {
    client: AsyncClient,
    eventloop: EventLoop,
    router: HandlerRouter,
    state_tx: watch::Sender<ConnectionState>,
    backoff: Backoff,
    /// Subscriptions still outstanding since the last CONNACK; `None` once connected.
    handshake: Option<Handshake>,
    /// Completed on the first CONNACK or the first failure, whichever comes first.
    ready: Option<oneshot::Sender<Result<()>>>,
}

#[derive(Debug, Default)]
struct Handshake {
    /// Re-subscribe requests queued but not yet written to the socket
    queued: usize,
    /// Packet ids sent during the handshake and not yet acknowledged
    unacked: HashSet<u16>,
}

impl Handshake {
    fn is_complete(&self) -> bool {
        self.queued == 0 && self.unacked.is_empty()
    }
}

impl ConnectionKernel {
    async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    self.disconnect().await;
                    break;
                }
                polled = self.eventloop.poll() => match polled {
                    Ok(event) => self.handle_event(event),
                    Err(e) => {
                        if !self.handle_error(e, &mut shutdown_rx).await {
                            break;
                        }
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected("closed".to_string()));
        tracing::info!("MQTT connection task stopped");
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                tracing::info!("MQTT broker acknowledged connection (session_present={})", ack.session_present);
                self.backoff.reset();
                self.resubscribe();
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Ok(()));
                }
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                // Anything sent during the handshake, including filters
                // registered after the re-subscribe snapshot, gates Connected.
                if let Some(handshake) = self.handshake.as_mut() {
                    handshake.queued = handshake.queued.saturating_sub(1);
                    handshake.unacked.insert(pkid);
                }
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                if let Some(handshake) = self.handshake.as_mut() {
                    handshake.unacked.remove(&ack.pkid);
                }
                self.finish_handshake();
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let message = InboundMessage::new(publish.topic, publish.payload);
                tracing::trace!("Received message on {}", message.topic);
                self.router.route(&message);
            }
            Event::Incoming(Packet::Disconnect) => {
                tracing::warn!("MQTT broker sent DISCONNECT");
            }
            _ => {}
        }
    }

    /// Re-issue every registered subscription; `Connected` follows the last SUBACK.
    fn resubscribe(&mut self) {
        let mut handshake = Handshake::default();
        for (filter, qos) in self.router.filters() {
            // try_subscribe: this task is the one draining the request queue.
            match self.client.try_subscribe(filter.as_str(), qos.into()) {
                Ok(()) => handshake.queued += 1,
                Err(e) => tracing::error!("Failed to re-subscribe to {}: {}", filter, e),
            }
        }

        if handshake.queued > 0 {
            tracing::debug!("Re-subscribing {} topic filters", handshake.queued);
        }
        self.handshake = Some(handshake);
        self.finish_handshake();
    }

    fn finish_handshake(&mut self) {
        if self.handshake.as_ref().is_some_and(Handshake::is_complete) {
            self.handshake = None;
            self.set_state(ConnectionState::Connected);
        }
    }

    /// Returns false when the task should stop.
    async fn handle_error(
        &mut self,
        error: ConnectionError,
        shutdown_rx: &mut mpsc::Receiver<()>,
    ) -> bool {
        let reason = error.to_string();
        self.handshake = None;

        if let Some(ready) = self.ready.take() {
            tracing::error!("MQTT connection failed: {}", reason);
            let _ = ready.send(Err(TransportError::Connection(reason)));
            return false;
        }

        if is_fatal(&error) {
            tracing::error!("MQTT broker refused connection, not retrying: {}", reason);
            self.set_state(ConnectionState::Disconnected(reason));
            return false;
        }

        tracing::warn!("MQTT connection lost: {}", reason);
        self.set_state(ConnectionState::Disconnected(reason));

        let delay = match self.backoff.next_delay() {
            Ok(delay) => delay,
            Err(e) => {
                tracing::error!("Giving up on MQTT broker: {}", e);
                self.set_state(ConnectionState::Disconnected(e.to_string()));
                return false;
            }
        };

        let attempt = self.backoff.attempt();
        tracing::info!("Reconnecting in {:?} (attempt {})", delay, attempt);
        self.set_state(ConnectionState::Reconnecting { attempt, delay });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.recv() => return false,
        }

        self.set_state(ConnectionState::Connecting);
        true
    }

    async fn disconnect(&mut self) {
        if self.client.try_disconnect().is_err() {
            return;
        }
        // Drive the loop until the DISCONNECT is flushed.
        let _ = timeout(Duration::from_secs(1), async {
            while let Ok(event) = self.eventloop.poll().await {
                if matches!(event, Event::Outgoing(Outgoing::Disconnect)) {
                    break;
                }
            }
        })
        .await;
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::debug!("Connection state: {} -> {}", current, state);
                *current = state;
                true
            }
        });
    }
}

fn is_fatal(error: &ConnectionError) -> bool {
    matches!(
        error,
        ConnectionError::ConnectionRefused(
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized
        )
    )
}
