//! Outlet for everything the broker reports: alert notifications and
//! access-log records.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::fanout::NotificationFanout;
use crate::record::{AccessLogRecord, DeviceEvent};

/// Shared handle used by the router, dispatcher and liveness monitor.
#[derive(Clone)]
pub struct EventSink {
    fanout: NotificationFanout,
    access_log: mpsc::UnboundedSender<AccessLogRecord>,
}

impl EventSink {
    /// Create a sink and the receiving end of its access log.
    pub fn new(fanout: NotificationFanout) -> (Self, AccessLogStream) {
        let (access_log, rx) = mpsc::unbounded_channel();
        (Self { fanout, access_log }, AccessLogStream { rx })
    }

    /// Forward a notification to interested consumers.
    pub fn notify(&self, event: DeviceEvent) {
        tracing::debug!("Notify {} for device {}", event.kind.name(), event.device_id);
        self.fanout.publish(event);
    }

    /// Emit an access-log record for persistence.
    pub fn record(&self, record: AccessLogRecord) {
        tracing::debug!(
            "Access log: device={} outcome={:?} type={:?} alert={:?}",
            record.device_id,
            record.outcome,
            record.access_type,
            record.alert
        );
        if self.access_log.send(record).is_err() {
            tracing::warn!("Access log stream closed, record discarded");
        }
    }

    pub fn fanout(&self) -> &NotificationFanout {
        &self.fanout
    }
}

/// Access-log records in emission order.
///
/// Records are buffered without bound until read, so the persistence layer
/// should take and drain this stream.
pub struct AccessLogStream {
    rx: mpsc::UnboundedReceiver<AccessLogRecord>,
}

impl AccessLogStream {
    /// Wait for the next record; `None` once the broker has shut down.
    pub async fn recv(&mut self) -> Option<AccessLogRecord> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AccessLogRecord> {
        self.rx.try_recv().ok()
    }
}

impl Stream for AccessLogStream {
    type Item = AccessLogRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::AllDevices;
    use crate::record::{AccessOutcome, AccessType, EventKind};
    use crate::types::{ConsumerId, DeviceId};
    use futures::StreamExt;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_records_flow_to_access_log() {
        let fanout = NotificationFanout::new(Arc::new(AllDevices), 4);
        let (sink, mut log) = EventSink::new(fanout);

        sink.record(AccessLogRecord::new(
            DeviceId::new("CAB001"),
            AccessOutcome::Granted,
            AccessType::Remote,
        ));
        drop(sink);

        let records: Vec<_> = log.by_ref().collect().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, AccessOutcome::Granted);
        assert!(log.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_notify_uses_fanout() {
        let fanout = NotificationFanout::new(Arc::new(AllDevices), 4);
        let mut alerts = fanout.subscribe(ConsumerId::new("admin"));
        let (sink, _log) = EventSink::new(fanout);

        sink.notify(DeviceEvent::new(DeviceId::new("CAB001"), EventKind::Tamper));
        let event = alerts.recv().await.unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Tamper);
    }
}
