//! Idle power control for the two pipeline workers.
//!
//! Both workers' states live in one watch channel so composite transitions (such as
//! "suspend acquisition only if the dispatcher is already suspended") happen atomically
//! under the channel's lock. Workers suspend themselves; only admission wakes them.

use futures::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Run state of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Active,
    Suspended,
}

/// The two self-suspending workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Worker {
    Acquisition,
    Dispatcher,
}

/// Snapshot of both workers' states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerStates {
    pub acquisition: PowerState,
    pub dispatcher: PowerState,
}

impl PowerStates {
    pub fn get(&self, worker: Worker) -> PowerState {
        match worker {
            Worker::Acquisition => self.acquisition,
            Worker::Dispatcher => self.dispatcher,
        }
    }

    fn set(&mut self, worker: Worker, state: PowerState) {
        match worker {
            Worker::Acquisition => self.acquisition = state,
            Worker::Dispatcher => self.dispatcher = state,
        }
    }

    /// Both workers suspended
    pub fn is_idle(&self) -> bool {
        self.acquisition == PowerState::Suspended && self.dispatcher == PowerState::Suspended
    }
}

impl Default for PowerStates {
    fn default() -> Self {
        Self { acquisition: PowerState::Active, dispatcher: PowerState::Active }
    }
}

/// Shared power state machine.
#[derive(Debug)]
pub struct PowerController {
    states: watch::Sender<PowerStates>,
}

impl Default for PowerController {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerController {
    pub fn new() -> Self {
        let (states, _) = watch::channel(PowerStates::default());
        Self { states }
    }

    /// Current state of both workers.
    pub fn states(&self) -> PowerStates {
        *self.states.borrow()
    }

    pub fn state(&self, worker: Worker) -> PowerState {
        self.states.borrow().get(worker)
    }

    /// Stream of state snapshots, starting with the current one.
    pub fn updates(&self) -> impl Stream<Item = PowerStates> + Send + use<> {
        WatchStream::new(self.states.subscribe())
    }

    /// Mark the dispatcher suspended.
    ///
    /// The caller must re-check for work after this returns and call
    /// [`PowerController::resume`] if it finds any; admission enqueues before waking, so
    /// either the re-check or the wake observes the new client.
    pub fn suspend_dispatcher(&self) {
        self.states.send_modify(|s| s.dispatcher = PowerState::Suspended);
        debug!("Dispatcher suspended");
    }

    /// Mark acquisition suspended, but only if the dispatcher already is.
    ///
    /// Returns whether acquisition is now suspended.
    pub fn suspend_acquisition_if_idle(&self) -> bool {
        let suspended = self.states.send_if_modified(|s| {
            if s.dispatcher == PowerState::Suspended && s.acquisition == PowerState::Active {
                s.acquisition = PowerState::Suspended;
                true
            } else {
                false
            }
        });
        if suspended {
            debug!("Acquisition suspended");
        }
        suspended || self.state(Worker::Acquisition) == PowerState::Suspended
    }

    /// Mark a worker active again without waking the other one.
    pub fn resume(&self, worker: Worker) {
        self.states.send_if_modified(|s| {
            let changed = s.get(worker) != PowerState::Active;
            s.set(worker, PowerState::Active);
            changed
        });
    }

    /// Wake both workers. Returns whether either was suspended.
    pub fn wake_all(&self) -> bool {
        let woke = self.states.send_if_modified(|s| {
            let was_idle = *s != PowerStates::default();
            *s = PowerStates::default();
            was_idle
        });
        if woke {
            debug!("Workers woken by admission");
        }
        woke
    }

    /// Wait until `worker` is active again.
    ///
    /// Returns `false` if `cancel` fired first.
    pub async fn wait_until_active(&self, worker: Worker, cancel: &CancellationToken) -> bool {
        let mut rx = self.states.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => false,
            result = rx.wait_for(|s| s.get(worker) == PowerState::Active) => result.is_ok(),
        }
    }
}
