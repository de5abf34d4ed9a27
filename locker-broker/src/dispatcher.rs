//! Command dispatch and acknowledgment correlation.
//!
//! Each dispatched command gets a fresh correlation id and an entry in the
//! pending table. The entry is removed exactly once, by whichever comes first:
//! - a matching acknowledgment forwarded by the event router
//! - the shared timeout sweep finding it past its deadline
//! - the caller cancelling or dropping its [`CommandHandle`]
//!
//! Removal is what makes resolution idempotent: anything arriving for a
//! correlation id that is no longer pending is logged and discarded.
//!
//! At most one command per device is pending at a time. The table keeps two
//! maps; `by_device` is always locked before `by_id` when both are needed.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mqtt_transport::{Backoff, Qos, Transport, TransportError};
use tokio::sync::oneshot;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::event::{CommandMessage, InboundEvent, TopicLayout};
use crate::record::{AccessLogRecord, AccessOutcome, AccessType, DeviceEvent, EventKind};
use crate::registry::DeviceRegistry;
use crate::sink::EventSink;
use crate::task::BackgroundTask;
use crate::types::{CommandKind, CommandOutcome, CorrelationId, DeviceId};

const MAX_PUBLISH_BACKOFF: Duration = Duration::from_secs(5);

/// A command awaiting acknowledgment.
#[derive(Debug)]
struct PendingCommand {
    correlation_id: CorrelationId,
    device_id: DeviceId,
    kind: CommandKind,
    issued_at: DateTime<Utc>,
    deadline: Instant,
    result_tx: oneshot::Sender<CommandOutcome>,
}

#[derive(Debug, Default)]
struct PendingTable {
    by_id: DashMap<CorrelationId, PendingCommand>,
    by_device: DashMap<DeviceId, CorrelationId>,
}

impl PendingTable {
    /// Record a command unless its device already has one outstanding.
    fn insert(&self, command: PendingCommand) -> std::result::Result<(), CorrelationId> {
        match self.by_device.entry(command.device_id.clone()) {
            Entry::Occupied(existing) => Err(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(command.correlation_id.clone());
                self.by_id.insert(command.correlation_id.clone(), command);
                Ok(())
            }
        }
    }

    /// Remove a command. Only the first caller for a given id gets it.
    fn take(&self, correlation_id: &CorrelationId) -> Option<PendingCommand> {
        let (_, command) = self.by_id.remove(correlation_id)?;
        self.by_device
            .remove_if(&command.device_id, |_, id| id == correlation_id);
        Some(command)
    }

    fn peek(&self, correlation_id: &CorrelationId) -> Option<(DeviceId, CommandKind)> {
        self.by_id
            .get(correlation_id)
            .map(|command| (command.device_id.clone(), command.kind))
    }

    fn overdue(&self, now: Instant) -> Vec<CorrelationId> {
        self.by_id
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn in_flight(&self, device_id: &DeviceId) -> Option<CorrelationId> {
        self.by_device.get(device_id).map(|id| id.clone())
    }

    fn len(&self) -> usize {
        self.by_id.len()
    }
}

struct DispatcherInner {
    transport: Arc<dyn Transport>,
    registry: DeviceRegistry,
    topics: TopicLayout,
    sink: EventSink,
    pending: PendingTable,
    publish_retry_attempts: u32,
    publish_retry_backoff: Duration,
}

/// Issues commands and correlates their acknowledgments.
#[derive(Clone)]
pub struct CommandDispatcher {
    inner: Arc<DispatcherInner>,
}

impl CommandDispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: DeviceRegistry,
        sink: EventSink,
        config: &BrokerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                transport,
                registry,
                topics: TopicLayout::new(config.topic_prefix.clone()),
                sink,
                pending: PendingTable::default(),
                publish_retry_attempts: config.publish_retry_attempts,
                publish_retry_backoff: config.publish_retry_backoff,
            }),
        }
    }

    /// Send `kind` to `device_id` and return a handle resolving on acknowledgment.
    ///
    /// Fails immediately with `DeviceOffline` if the device is unknown or
    /// offline and with `CommandInFlight` if it already has a pending
    /// command. Publish failures are retried; if every attempt fails the
    /// command is withdrawn and the transport error returned.
    pub async fn dispatch(
        &self,
        device_id: &DeviceId,
        kind: CommandKind,
        timeout: Duration,
    ) -> Result<CommandHandle> {
        match self.inner.registry.get(device_id) {
            None => {
                return Err(BrokerError::DeviceOffline {
                    device_id: device_id.clone(),
                    registered: false,
                })
            }
            Some(state) if !state.is_online() => {
                return Err(BrokerError::DeviceOffline {
                    device_id: device_id.clone(),
                    registered: true,
                })
            }
            Some(_) => {}
        }

        let deadline = Instant::now().checked_add(timeout).ok_or_else(|| {
            BrokerError::Configuration(format!("Command timeout {timeout:?} is out of range"))
        })?;

        let correlation_id = CorrelationId::generate();
        let issued_at = Utc::now();
        let payload = CommandMessage::new(correlation_id.clone(), device_id.clone(), kind, issued_at)
            .to_payload()?;

        let (result_tx, result_rx) = oneshot::channel();
        let command = PendingCommand {
            correlation_id: correlation_id.clone(),
            device_id: device_id.clone(),
            kind,
            issued_at,
            deadline,
            result_tx,
        };

        if let Err(in_flight) = self.inner.pending.insert(command) {
            tracing::debug!(
                "Rejecting {} for {}: command {} in flight",
                kind,
                device_id,
                in_flight
            );
            return Err(BrokerError::CommandInFlight {
                device_id: device_id.clone(),
                in_flight,
            });
        }

        // From here on, dropping the handle cancels the pending entry.
        let mut handle = CommandHandle {
            correlation_id: correlation_id.clone(),
            device_id: device_id.clone(),
            kind,
            result_rx,
            dispatcher: self.clone(),
            finished: false,
        };

        let topic = self.inner.topics.command_topic(device_id);
        if let Err(e) = self.inner.publish_with_retry(&topic, payload).await {
            tracing::error!("Failed to publish {} to {}: {}", kind, device_id, e);
            self.inner.pending.take(&correlation_id);
            handle.finished = true;
            return Err(e.into());
        }

        tracing::info!(
            "Dispatched {} to {} (correlation {}, timeout {:?})",
            kind,
            device_id,
            correlation_id,
            timeout
        );
        Ok(handle)
    }

    /// Resolve the pending command an acknowledging event refers to.
    ///
    /// A status update succeeds the command unless it reports a lock state
    /// contradicting it; a verify result succeeds it iff `success` is set.
    /// Returns false when nothing was resolved, e.g. for a late or
    /// duplicate acknowledgment.
    pub fn resolve(&self, event: &InboundEvent) -> bool {
        let Some(correlation_id) = event.correlation_id() else {
            return false;
        };

        let Some((device_id, kind)) = self.inner.pending.peek(correlation_id) else {
            tracing::warn!(
                "Discarding late or duplicate acknowledgment {} from {}",
                correlation_id,
                event.device_id()
            );
            return false;
        };

        if &device_id != event.device_id() {
            tracing::warn!(
                "Acknowledgment {} came from {} but the command targeted {}",
                correlation_id,
                event.device_id(),
                device_id
            );
            return false;
        }

        let outcome = match event {
            InboundEvent::StatusUpdate { lock_state, .. } => match lock_state {
                Some(reported) if *reported != kind.expected_lock_state() => {
                    CommandOutcome::Failed {
                        reason: format!("device reported {reported} after {kind}"),
                    }
                }
                _ => CommandOutcome::Succeeded {
                    subject_identity: None,
                },
            },
            InboundEvent::VerifyResult {
                success: true,
                subject_identity,
                ..
            } => CommandOutcome::Succeeded {
                subject_identity: subject_identity.clone(),
            },
            InboundEvent::VerifyResult { success: false, .. } => CommandOutcome::Failed {
                reason: "verification rejected".to_string(),
            },
            _ => return false,
        };

        let resolved = self.inner.complete(correlation_id, outcome);
        if !resolved {
            tracing::debug!("Command {} was resolved concurrently", correlation_id);
        }
        resolved
    }

    /// Cancel a pending command. No-op (returns false) once it has resolved.
    pub fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        self.inner.complete(correlation_id, CommandOutcome::Cancelled)
    }

    /// Time out every command whose deadline is at or before `now`.
    pub fn expire_overdue(&self, now: Instant) -> usize {
        self.inner
            .pending
            .overdue(now)
            .iter()
            .filter(|id| self.inner.complete(id, CommandOutcome::TimedOut))
            .count()
    }

    /// Correlation id of the device's outstanding command, if any.
    pub fn in_flight(&self, device_id: &DeviceId) -> Option<CorrelationId> {
        self.inner.pending.in_flight(device_id)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }
}

impl DispatcherInner {
    async fn publish_with_retry(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> std::result::Result<(), TransportError> {
        let mut backoff = Backoff::new(self.publish_retry_backoff, MAX_PUBLISH_BACKOFF, 2.0)
            .with_max_attempts(Some(self.publish_retry_attempts.saturating_sub(1)));

        loop {
            match self
                .transport
                .publish(topic, payload.clone(), Qos::AtLeastOnce)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => match backoff.next_delay() {
                    Ok(delay) => {
                        tracing::warn!("Publish to {} failed ({}), retrying in {:?}", topic, e, delay);
                        tokio::time::sleep(delay).await;
                    }
                    Err(_) => return Err(e),
                },
            }
        }
    }

    /// Remove the command and deliver `outcome`. False if it was already gone.
    fn complete(&self, correlation_id: &CorrelationId, outcome: CommandOutcome) -> bool {
        let Some(command) = self.pending.take(correlation_id) else {
            return false;
        };

        tracing::info!(
            "Command {} ({} -> {}, issued {}) {}",
            command.correlation_id,
            command.kind,
            command.device_id,
            command.issued_at.to_rfc3339(),
            outcome.as_str()
        );

        let (kind, access_outcome, subject) = match &outcome {
            CommandOutcome::Succeeded { subject_identity } => (
                EventKind::CommandSucceeded {
                    correlation_id: command.correlation_id.clone(),
                    command: command.kind,
                },
                AccessOutcome::Granted,
                subject_identity.clone(),
            ),
            CommandOutcome::Failed { reason } => (
                EventKind::CommandFailed {
                    correlation_id: command.correlation_id.clone(),
                    command: command.kind,
                    reason: reason.clone(),
                },
                AccessOutcome::Denied,
                None,
            ),
            CommandOutcome::TimedOut => (
                EventKind::CommandTimedOut {
                    correlation_id: command.correlation_id.clone(),
                    command: command.kind,
                },
                AccessOutcome::TimedOut,
                None,
            ),
            CommandOutcome::Cancelled => (
                EventKind::CommandCancelled {
                    correlation_id: command.correlation_id.clone(),
                    command: command.kind,
                },
                AccessOutcome::Cancelled,
                None,
            ),
        };

        self.sink.record(
            AccessLogRecord::new(command.device_id.clone(), access_outcome, AccessType::Remote)
                .with_subject(subject)
                .with_correlation_id(command.correlation_id.clone()),
        );
        self.sink
            .notify(DeviceEvent::new(command.device_id.clone(), kind));

        // The caller may have dropped its handle already.
        let _ = command.result_tx.send(outcome);
        true
    }
}

/// Confirmed completion of a command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReceipt {
    pub correlation_id: CorrelationId,
    pub device_id: DeviceId,
    pub kind: CommandKind,
    /// Identity reported by the device, for verification-backed commands
    pub subject_identity: Option<String>,
}

/// Future resolving when the device acknowledges a dispatched command.
///
/// Resolves to `CommandTimeout`, `CommandFailed` or `CommandCancelled` on the
/// corresponding outcomes. Dropping an unresolved handle cancels the command.
pub struct CommandHandle {
    correlation_id: CorrelationId,
    device_id: DeviceId,
    kind: CommandKind,
    result_rx: oneshot::Receiver<CommandOutcome>,
    dispatcher: CommandDispatcher,
    finished: bool,
}

impl CommandHandle {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Abandon the command. Returns false if it had already resolved.
    pub fn cancel(&mut self) -> bool {
        self.dispatcher.cancel(&self.correlation_id)
    }
}

impl Future for CommandHandle {
    type Output = Result<CommandReceipt>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let received = ready!(Pin::new(&mut self.result_rx).poll(cx));
        self.finished = true;

        let result = match received {
            Ok(CommandOutcome::Succeeded { subject_identity }) => Ok(CommandReceipt {
                correlation_id: self.correlation_id.clone(),
                device_id: self.device_id.clone(),
                kind: self.kind,
                subject_identity,
            }),
            Ok(CommandOutcome::Failed { reason }) => Err(BrokerError::CommandFailed {
                device_id: self.device_id.clone(),
                correlation_id: self.correlation_id.clone(),
                reason,
            }),
            Ok(CommandOutcome::TimedOut) => Err(BrokerError::CommandTimeout {
                device_id: self.device_id.clone(),
                correlation_id: self.correlation_id.clone(),
            }),
            Ok(CommandOutcome::Cancelled) => {
                Err(BrokerError::CommandCancelled(self.correlation_id.clone()))
            }
            Err(_) => Err(BrokerError::ShutdownError(format!(
                "command {} abandoned by dispatcher",
                self.correlation_id
            ))),
        };
        Poll::Ready(result)
    }
}

impl Drop for CommandHandle {
    fn drop(&mut self) {
        if !self.finished && self.dispatcher.cancel(&self.correlation_id) {
            tracing::debug!("Command {} cancelled by dropped handle", self.correlation_id);
        }
    }
}

/// Shared periodic sweep that times out overdue commands.
pub struct TimeoutSweep {
    task: BackgroundTask,
}

impl TimeoutSweep {
    pub fn start(dispatcher: CommandDispatcher, period: Duration) -> Self {
        let task = BackgroundTask::spawn("timeout sweep", move |mut shutdown_rx| async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = dispatcher.expire_overdue(Instant::now());
                        if expired > 0 {
                            tracing::debug!("Timeout sweep expired {} command(s)", expired);
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Self { task }
    }

    pub async fn shutdown(self) -> Result<()> {
        self.task.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::{AllDevices, NotificationFanout};
    use crate::sink::AccessLogStream;
    use crate::types::{DevicePatch, LockState, OnlineState};
    use mqtt_transport::InMemoryTransport;

    struct Fixture {
        transport: InMemoryTransport,
        registry: DeviceRegistry,
        dispatcher: CommandDispatcher,
        access_log: AccessLogStream,
    }

    fn fixture() -> Fixture {
        let transport = InMemoryTransport::new();
        let registry = DeviceRegistry::new();
        let fanout = NotificationFanout::new(Arc::new(AllDevices), 16);
        let (sink, access_log) = EventSink::new(fanout);
        let config = BrokerConfig::default().with_publish_retry(3, Duration::from_millis(10));
        let dispatcher =
            CommandDispatcher::new(Arc::new(transport.clone()), registry.clone(), sink, &config);

        registry.upsert(
            &DeviceId::new("CAB001"),
            DevicePatch::new()
                .online_state(OnlineState::Online)
                .lock_state(LockState::Locked)
                .heartbeat(Instant::now()),
        );

        Fixture {
            transport,
            registry,
            dispatcher,
            access_log,
        }
    }

    fn status_ack(correlation_id: &CorrelationId, lock_state: LockState) -> InboundEvent {
        InboundEvent::StatusUpdate {
            device_id: DeviceId::new("CAB001"),
            lock_state: Some(lock_state),
            online_state: None,
            correlation_id: Some(correlation_id.clone()),
        }
    }

    #[tokio::test]
    async fn test_unknown_and_offline_devices_are_rejected() {
        let f = fixture();

        let err = f
            .dispatcher
            .dispatch(&DeviceId::new("CAB404"), CommandKind::Unlock, Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BrokerError::DeviceOffline { registered: false, .. }));

        f.registry.upsert(
            &DeviceId::new("CAB001"),
            DevicePatch::new().online_state(OnlineState::Offline),
        );
        let err = f
            .dispatcher
            .dispatch(&DeviceId::new("CAB001"), CommandKind::Unlock, Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BrokerError::DeviceOffline { registered: true, .. }));
        assert!(f.transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_unrepresentable_timeout_is_rejected() {
        let f = fixture();

        let err = f
            .dispatcher
            .dispatch(&DeviceId::new("CAB001"), CommandKind::Unlock, Duration::MAX)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BrokerError::Configuration(_)));
        assert!(f.transport.published().is_empty());
        assert_eq!(f.dispatcher.pending_count(), 0);

        // The device is still free for a normal command.
        let handle = f
            .dispatcher
            .dispatch(&DeviceId::new("CAB001"), CommandKind::Unlock, Duration::from_secs(5))
            .await;
        assert!(handle.is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_publishes_command() {
        let f = fixture();
        let handle = f
            .dispatcher
            .dispatch(&DeviceId::new("CAB001"), CommandKind::Unlock, Duration::from_secs(5))
            .await
            .unwrap();

        let published = f.transport.published_to("device/CAB001/command");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].qos, Qos::AtLeastOnce);

        let message: CommandMessage = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(&message.correlation_id, handle.correlation_id());
        assert_eq!(message.action, CommandKind::Unlock);
        assert_eq!(f.dispatcher.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_second_dispatch_is_rejected_while_in_flight() {
        let f = fixture();
        let device = DeviceId::new("CAB001");
        let first = f
            .dispatcher
            .dispatch(&device, CommandKind::Unlock, Duration::from_secs(5))
            .await
            .unwrap();

        let err = f
            .dispatcher
            .dispatch(&device, CommandKind::Lock, Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        match err {
            BrokerError::CommandInFlight { in_flight, .. } => {
                assert_eq!(&in_flight, first.correlation_id())
            }
            other => panic!("expected CommandInFlight, got {other:?}"),
        }
        assert_eq!(f.transport.published().len(), 1);
        assert_eq!(f.dispatcher.in_flight(&device).as_ref(), Some(first.correlation_id()));
    }

    #[tokio::test]
    async fn test_matching_ack_resolves_once() {
        let mut f = fixture();
        let handle = f
            .dispatcher
            .dispatch(&DeviceId::new("CAB001"), CommandKind::Unlock, Duration::from_secs(5))
            .await
            .unwrap();
        let id = handle.correlation_id().clone();

        assert!(f.dispatcher.resolve(&status_ack(&id, LockState::Unlocked)));
        assert!(!f.dispatcher.resolve(&status_ack(&id, LockState::Unlocked)));
        assert!(!f.dispatcher.cancel(&id));

        let receipt = handle.await.unwrap();
        assert_eq!(receipt.correlation_id, id);
        assert_eq!(f.dispatcher.pending_count(), 0);

        let record = f.access_log.try_recv().unwrap();
        assert_eq!(record.outcome, AccessOutcome::Granted);
        assert_eq!(record.access_type, AccessType::Remote);
        assert_eq!(record.correlation_id, Some(id));
        assert!(f.access_log.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_handle_stays_pending_until_resolved() {
        let f = fixture();
        let handle = f
            .dispatcher
            .dispatch(&DeviceId::new("CAB001"), CommandKind::Lock, Duration::from_secs(5))
            .await
            .unwrap();
        let id = handle.correlation_id().clone();

        let mut task = tokio_test::task::spawn(handle);
        tokio_test::assert_pending!(task.poll());

        assert!(f.dispatcher.resolve(&status_ack(&id, LockState::Locked)));
        assert!(task.is_woken());
        let receipt = tokio_test::assert_ready_ok!(task.poll());
        assert_eq!(receipt.kind, CommandKind::Lock);
    }

    #[tokio::test]
    async fn test_contradicting_ack_fails_command() {
        let f = fixture();
        let handle = f
            .dispatcher
            .dispatch(&DeviceId::new("CAB001"), CommandKind::Unlock, Duration::from_secs(5))
            .await
            .unwrap();
        let id = handle.correlation_id().clone();

        assert!(f.dispatcher.resolve(&status_ack(&id, LockState::Locked)));
        assert!(matches!(handle.await, Err(BrokerError::CommandFailed { .. })));
    }

    #[tokio::test]
    async fn test_verify_result_resolves_with_subject() {
        let f = fixture();
        let handle = f
            .dispatcher
            .dispatch(&DeviceId::new("CAB001"), CommandKind::Unlock, Duration::from_secs(5))
            .await
            .unwrap();

        let ack = InboundEvent::VerifyResult {
            device_id: DeviceId::new("CAB001"),
            correlation_id: Some(handle.correlation_id().clone()),
            success: true,
            subject_identity: Some("alice".to_string()),
        };
        assert!(f.dispatcher.resolve(&ack));
        assert_eq!(handle.await.unwrap().subject_identity.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_ack_from_other_device_is_ignored() {
        let f = fixture();
        let handle = f
            .dispatcher
            .dispatch(&DeviceId::new("CAB001"), CommandKind::Unlock, Duration::from_secs(5))
            .await
            .unwrap();

        let spoofed = InboundEvent::StatusUpdate {
            device_id: DeviceId::new("CAB002"),
            lock_state: Some(LockState::Unlocked),
            online_state: None,
            correlation_id: Some(handle.correlation_id().clone()),
        };
        assert!(!f.dispatcher.resolve(&spoofed));
        assert_eq!(f.dispatcher.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdue_commands_time_out() {
        let f = fixture();
        let handle = f
            .dispatcher
            .dispatch(&DeviceId::new("CAB001"), CommandKind::Unlock, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(f.dispatcher.expire_overdue(Instant::now()), 0);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(f.dispatcher.expire_overdue(Instant::now()), 1);

        assert!(matches!(handle.await, Err(BrokerError::CommandTimeout { .. })));
        assert_eq!(
            f.registry.get(&DeviceId::new("CAB001")).unwrap().lock_state,
            LockState::Locked
        );
    }

    #[tokio::test]
    async fn test_cancel_and_drop_release_the_device() {
        let mut f = fixture();
        let device = DeviceId::new("CAB001");

        let mut handle = f
            .dispatcher
            .dispatch(&device, CommandKind::Unlock, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(matches!((&mut handle).await, Err(BrokerError::CommandCancelled(_))));

        let handle = f
            .dispatcher
            .dispatch(&device, CommandKind::Lock, Duration::from_secs(5))
            .await
            .unwrap();
        let id = handle.correlation_id().clone();
        drop(handle);
        assert_eq!(f.dispatcher.pending_count(), 0);
        assert!(!f.dispatcher.resolve(&status_ack(&id, LockState::Locked)));

        let outcomes: Vec<_> = std::iter::from_fn(|| f.access_log.try_recv())
            .map(|r| r.outcome)
            .collect();
        assert_eq!(outcomes, vec![AccessOutcome::Cancelled, AccessOutcome::Cancelled]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_publish_failures_are_retried() {
        let f = fixture();
        f.transport.fail_next_publishes(2);

        let handle = f
            .dispatcher
            .dispatch(&DeviceId::new("CAB001"), CommandKind::Unlock, Duration::from_secs(5))
            .await;
        assert!(handle.is_ok());
        assert_eq!(f.transport.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_publish_retries_withdraw_command() {
        let f = fixture();
        f.transport.fail_next_publishes(3);

        let err = f
            .dispatcher
            .dispatch(&DeviceId::new("CAB001"), CommandKind::Unlock, Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BrokerError::Transport(TransportError::Publish { .. })));
        assert_eq!(f.dispatcher.pending_count(), 0);
        assert!(f.dispatcher.in_flight(&DeviceId::new("CAB001")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_task_expires_commands() {
        let f = fixture();
        let sweep = TimeoutSweep::start(f.dispatcher.clone(), Duration::from_secs(5));

        let handle = f
            .dispatcher
            .dispatch(&DeviceId::new("CAB001"), CommandKind::Unlock, Duration::from_secs(5))
            .await
            .unwrap();

        let result = handle.await;
        assert!(matches!(result, Err(BrokerError::CommandTimeout { .. })));
        sweep.shutdown().await.unwrap();
    }
}
