//! Stream dispatcher: round-robin delivery of the published frame.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::Result;
use crate::frame::FrameSync;
use crate::power::{PowerController, Worker};
use crate::registry::{ClientConnection, ClientId, ClientRegistry, Transport};

/// Outcome of one dispatch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Nobody to serve, or no frame published yet
    Idle,
    /// Client sent one part and went back to the tail of the queue
    Served(ClientId),
    /// Client was disconnected and has been removed
    Dropped(ClientId),
}

/// Serves one client per cycle from the registry.
///
/// The cycle interval is the acquisition period divided by the number of active clients,
/// so each of K clients receives roughly one frame per acquisition period. Deadlines are
/// absolute; a late cycle does not push the following ones back.
pub struct DispatchWorker<T> {
    registry: Arc<ClientRegistry<ClientConnection<T>>>,
    sync: Arc<FrameSync>,
    power: Arc<PowerController>,
    frame_ready: Arc<Notify>,
    period: Duration,
}

impl<T: Transport> DispatchWorker<T> {
    pub fn new(
        registry: Arc<ClientRegistry<ClientConnection<T>>>,
        sync: Arc<FrameSync>,
        power: Arc<PowerController>,
        frame_ready: Arc<Notify>,
        period: Duration,
    ) -> Self {
        Self { registry, sync, power, frame_ready, period }
    }

    /// Run until cancelled.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        debug!("Dispatcher waiting for the first frame");
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = self.frame_ready.notified() => {}
        }
        info!("Dispatcher started");

        let mut served = 0u64;
        let mut dropped = 0u64;
        let mut deadline = Instant::now();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let active = self.registry.enrolled();
            if active == 0 {
                if !self.idle(&cancel).await {
                    break;
                }
                deadline = Instant::now();
                continue;
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.dispatch_next() => outcome,
            };
            match outcome {
                Dispatch::Served(_) => served += 1,
                Dispatch::Dropped(_) => dropped += 1,
                Dispatch::Idle => {}
            }
            tokio::task::yield_now().await;

            let interval = self.period / active.max(1) as u32;
            deadline += interval;
            let now = Instant::now();
            if deadline < now {
                trace!("Dispatch cycle overran by {:?}", now - deadline);
                deadline = now;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep_until(deadline) => {}
            }
        }

        info!("Dispatcher ended ({} parts sent, {} clients dropped)", served, dropped);
        Ok(())
    }

    /// Suspend until admission brings a client. Returns `false` when cancelled.
    async fn idle(&self, cancel: &CancellationToken) -> bool {
        self.power.suspend_dispatcher();
        // Admission enqueues before waking, so a client that slipped in is seen here.
        // Pending admissions are left to their own wake-up.
        if self.registry.enrolled() > 0 {
            self.power.resume(Worker::Dispatcher);
            return true;
        }
        debug!("No stream clients, dispatcher idle");
        let woke = self.power.wait_until_active(Worker::Dispatcher, cancel).await;
        if woke {
            debug!("Dispatcher resumed with {} clients", self.registry.enrolled());
        }
        woke
    }

    /// Serve the client at the head of the queue.
    ///
    /// A disconnected client is dropped without being sent anything. Otherwise the
    /// published frame is written under the synchronizer token, the token is released,
    /// and the client is re-enqueued if the write succeeded.
    pub async fn dispatch_next(&self) -> Dispatch {
        let Some(mut client) = self.registry.checkout() else {
            return Dispatch::Idle;
        };
        let id = client.id();

        if !client.is_connected() {
            debug!(client = %id, "Stream client disconnected after {} frames", client.frames_sent());
            return Dispatch::Dropped(id);
        }

        let lease = self.sync.lease().await;
        if lease.is_empty() {
            drop(lease);
            client.requeue();
            return Dispatch::Idle;
        }
        let sequence = lease.sequence();
        let result = client.send_frame(lease.bytes()).await;
        drop(lease);

        match result {
            Ok(()) => {
                trace!(client = %id, sequence, "Part sent");
                client.requeue();
                Dispatch::Served(id)
            }
            Err(e) => {
                debug!(client = %id, "Dropping stream client: {}", e);
                Dispatch::Dropped(id)
            }
        }
    }
}
