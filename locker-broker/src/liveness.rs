//! Periodic detection of devices that stopped sending heartbeats.

use std::time::Duration;

use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::error::Result;
use crate::record::{DeviceEvent, EventKind};
use crate::registry::DeviceRegistry;
use crate::sink::EventSink;
use crate::task::BackgroundTask;

/// Marks stale devices offline every `check_interval`.
///
/// Each online-to-offline transition produces exactly one `DeviceOffline`
/// notification; the registry only reports devices that actually changed.
pub struct LivenessMonitor {
    task: BackgroundTask,
}

impl LivenessMonitor {
    pub fn start(
        registry: DeviceRegistry,
        sink: EventSink,
        stale_after: Duration,
        check_interval: Duration,
    ) -> Self {
        let task = BackgroundTask::spawn("liveness monitor", move |mut shutdown_rx| async move {
            let mut ticker = interval(check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        check(&registry, &sink, Instant::now(), stale_after);
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

fn check(registry: &DeviceRegistry, sink: &EventSink, now: Instant, stale_after: Duration) {
    for device_id in registry.mark_offline_if_stale(now, stale_after) {
        tracing::warn!("Device {} missed heartbeats for {:?}, marking offline", device_id, stale_after);
        sink.notify(DeviceEvent::new(device_id, EventKind::DeviceOffline));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::{AllDevices, NotificationFanout};
    use crate::types::{ConsumerId, DeviceId, DevicePatch, OnlineState};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_stale_device_reported_offline_once() {
        let registry = DeviceRegistry::new();
        let fanout = NotificationFanout::new(Arc::new(AllDevices), 16);
        let mut alerts = fanout.subscribe(ConsumerId::new("admin"));
        let (sink, _log) = EventSink::new(fanout);

        registry.upsert(
            &DeviceId::new("CAB001"),
            DevicePatch::new()
                .online_state(OnlineState::Online)
                .heartbeat(Instant::now()),
        );

        let monitor = LivenessMonitor::start(
            registry.clone(),
            sink,
            Duration::from_secs(90),
            Duration::from_secs(15),
        );

        tokio::time::sleep(Duration::from_secs(80)).await;
        assert!(alerts.try_recv().is_none());
        assert!(registry.get(&DeviceId::new("CAB001")).unwrap().is_online());

        tokio::time::sleep(Duration::from_secs(60)).await;
        let event = alerts.try_recv().unwrap().unwrap();
        assert_eq!(event.kind, EventKind::DeviceOffline);
        assert!(!registry.get(&DeviceId::new("CAB001")).unwrap().is_online());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(alerts.try_recv().is_none());

        monitor.shutdown().await.unwrap();
    }
}
