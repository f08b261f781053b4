//! Frame acquisition worker: sensor to double buffer at a fixed rate.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::Result;
use crate::frame::{FrameSlot, FrameSync};
use crate::memory::MemoryPools;
use crate::power::{PowerController, Worker};
use crate::sensor::{SensorDriver, SharedSensor};

/// Pulls frames from the sensor into the filling slot and publishes them.
///
/// One cycle per `period`: capture, copy into the slot this worker owns (growing it when
/// needed), wait out the rest of the period, swap under the synchronizer token, signal
/// the dispatcher. When the dispatcher has gone idle the worker suspends itself after the
/// swap and stays suspended until admission wakes it.
pub struct AcquisitionWorker<S> {
    sensor: SharedSensor<S>,
    sync: Arc<FrameSync>,
    pools: Arc<MemoryPools>,
    power: Arc<PowerController>,
    frame_ready: Arc<Notify>,
    period: Duration,
}

impl<S: SensorDriver> AcquisitionWorker<S> {
    pub fn new(
        sensor: SharedSensor<S>,
        sync: Arc<FrameSync>,
        pools: Arc<MemoryPools>,
        power: Arc<PowerController>,
        frame_ready: Arc<Notify>,
        period: Duration,
    ) -> Self {
        Self { sensor, sync, pools, power, frame_ready, period }
    }

    /// Run until cancelled.
    ///
    /// Returns an error only for fatal conditions (both memory pools exhausted); sensor
    /// failures skip the cycle and leave the previous frame published.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!("Acquisition worker started ({:?} period)", self.period);
        let mut filling = FrameSlot::new();
        let mut sequence = 0u64;
        let mut failures = 0u64;

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            let captured = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.capture_into(&mut filling, sequence + 1) => result,
            };

            let fresh = match captured {
                Ok(()) => {
                    sequence += 1;
                    true
                }
                Err(e) if e.is_fatal() => {
                    error!("Acquisition stopped: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    failures += 1;
                    warn!("Capture failed, keeping previous frame ({} failures): {}", failures, e);
                    false
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if fresh {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.sync.publish(&mut filling) => {}
                }
                self.frame_ready.notify_one();
            }
            tokio::task::yield_now().await;

            if self.power.suspend_acquisition_if_idle() {
                debug!("No stream clients, acquisition idle after frame {}", sequence);
                if !self.power.wait_until_active(Worker::Acquisition, &cancel).await {
                    break;
                }
                debug!("Acquisition resumed");
                ticker.reset();
            }
        }

        info!("Acquisition worker ended ({} frames, {} failed captures)", sequence, failures);
        Ok(())
    }

    async fn capture_into(&self, slot: &mut FrameSlot, sequence: u64) -> Result<()> {
        let mut sensor = self.sensor.lock().await;
        let frame = sensor.capture().await?;
        slot.store(frame, sequence, &self.pools)?;
        trace!(sequence, len = frame.len(), capacity = slot.capacity(), "Frame captured");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamError;
    use crate::memory::MemoryBudget;
    use crate::power::PowerState;
    use crate::sensor::shared;
    use crate::sensors::SyntheticSensor;
    use crate::test_utils::{FlakySensor, roomy_pools};

    const PERIOD: Duration = Duration::from_millis(1000 / 14);

    struct Rig<S> {
        sensor: SharedSensor<S>,
        sync: Arc<FrameSync>,
        power: Arc<PowerController>,
        frame_ready: Arc<Notify>,
    }

    fn rig<S: SensorDriver>(sensor: S) -> Rig<S> {
        Rig {
            sensor: shared(sensor),
            sync: Arc::new(FrameSync::new()),
            power: Arc::new(PowerController::new()),
            frame_ready: Arc::new(Notify::new()),
        }
    }

    impl<S: SensorDriver> Rig<S> {
        fn worker(&self, pools: Arc<MemoryPools>) -> AcquisitionWorker<S> {
            AcquisitionWorker::new(
                Arc::clone(&self.sensor),
                Arc::clone(&self.sync),
                pools,
                Arc::clone(&self.power),
                Arc::clone(&self.frame_ready),
                PERIOD,
            )
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_one_frame_per_period() {
        let _ = tracing_subscriber::fmt::try_init();
        let rig = rig(SyntheticSensor::new().with_scale(0.01));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(rig.worker(roomy_pools()).run(cancel.clone()));

        rig.frame_ready.notified().await;
        assert_eq!(rig.sync.published_sequence(), 1);

        tokio::time::sleep(PERIOD * 10).await;
        let published = rig.sync.published_sequence();
        assert!((10..=12).contains(&published), "published {published} frames");

        let lease = rig.sync.lease().await;
        assert_eq!(SyntheticSensor::frame_sequence(lease.bytes()), Some(lease.sequence()));
        drop(lease);

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn suspends_only_after_the_dispatcher() {
        let rig = rig(SyntheticSensor::new().with_scale(0.01));
        let cancel = CancellationToken::new();
        rig.power.suspend_dispatcher();
        let task = tokio::spawn(rig.worker(roomy_pools()).run(cancel.clone()));

        tokio::time::sleep(PERIOD * 20).await;
        assert_eq!(rig.power.state(Worker::Acquisition), PowerState::Suspended);
        assert_eq!(rig.sensor.lock().await.captures(), 1, "no sensor calls while suspended");
        assert_eq!(rig.sync.published_sequence(), 1, "last frame stays published");

        // Woken, but the dispatcher finds nobody to serve and goes idle again
        rig.power.wake_all();
        rig.power.suspend_dispatcher();
        tokio::time::sleep(PERIOD + PERIOD / 2).await;
        assert_eq!(rig.power.state(Worker::Acquisition), PowerState::Suspended);
        assert_eq!(rig.sensor.lock().await.captures(), 2, "one more cycle, then idle again");

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn sensor_failures_skip_the_cycle() {
        let rig = rig(FlakySensor::new(2));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(rig.worker(roomy_pools()).run(cancel.clone()));

        tokio::time::sleep(PERIOD * 10 + PERIOD / 2).await;
        let attempts = rig.sensor.lock().await.attempts();
        assert!(attempts >= 10);
        // Only successful captures are published, and sequence numbers stay dense
        let published = rig.sync.published_sequence();
        assert!(published + 1 >= attempts / 2 && published <= attempts.div_ceil(2));
        let lease = rig.sync.lease().await;
        assert_eq!(SyntheticSensor::frame_sequence(lease.bytes()), Some(published));
        drop(lease);

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn pool_exhaustion_is_fatal() {
        let rig = rig(SyntheticSensor::new().with_scale(0.01));
        let pools = MemoryPools::new(MemoryBudget { internal_bytes: 256, external_bytes: 0 });
        let result = rig.worker(pools).run(CancellationToken::new()).await;

        let err = result.unwrap_err();
        assert!(matches!(err, StreamError::AllocationExhausted { .. }));
        assert_eq!(rig.sync.published_sequence(), 0);
    }
}
