//! HTTP front end that assembles and runs one capture pipeline.
//!
//! [`StreamServer::bind`] builds every pipeline component from a [`StreamConfig`] and a
//! sensor; [`StreamServer::run`] spawns the acquisition and dispatch workers next to the
//! HTTP server until it is shut down or the pipeline has to be rebuilt. A fatal worker
//! error or a restart request makes `run` return that error after every task has been
//! stopped; the caller decides whether to build a fresh server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::acquisition::AcquisitionWorker;
use crate::config::StreamConfig;
use crate::frame::FrameSync;
use crate::http::{self, AppState};
use crate::memory::MemoryPools;
use crate::power::{PowerController, PowerStates};
use crate::registry::{ClientConnection, ClientRegistry};
use crate::sensor::{SensorDriver, shared};
use crate::settings::SettingsStore;
use crate::stream::{Admission, BodySender, DispatchWorker};
use crate::{Result, StreamError};

/// How long open connections get to finish once the server stops.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

type StreamRegistry = ClientRegistry<ClientConnection<BodySender>>;

/// Cloneable view of a running server, for observation and shutdown.
#[derive(Clone)]
pub struct ServerHandle {
    registry: Arc<StreamRegistry>,
    power: Arc<PowerController>,
    sync: Arc<FrameSync>,
    cancel: CancellationToken,
}

impl ServerHandle {
    /// Stream clients currently enrolled
    pub fn active_clients(&self) -> usize {
        self.registry.len()
    }

    /// Current worker power states
    pub fn power_states(&self) -> PowerStates {
        self.power.states()
    }

    /// Power controller, for subscribing to state changes
    pub fn power(&self) -> &Arc<PowerController> {
        &self.power
    }

    /// Sequence number of the most recently published frame
    pub fn published_sequence(&self) -> u64 {
        self.sync.published_sequence()
    }

    /// Stop the server; [`StreamServer::run`] returns `Ok(())`.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// One bound pipeline. Dropping it without running it cancels its handle.
pub struct StreamServer<S> {
    listener: TcpListener,
    state: Arc<AppState<S>>,
    handle: ServerHandle,
    pools: Arc<MemoryPools>,
    frame_ready: Arc<Notify>,
    period: Duration,
    restart_rx: mpsc::UnboundedReceiver<String>,
    _cancel_on_drop: DropGuard,
}

impl<S: SensorDriver> StreamServer<S> {
    /// Build the pipeline and bind the listening socket.
    ///
    /// Counts a boot in the settings store and applies stored setting overrides to the
    /// sensor before anything is captured.
    pub async fn bind(config: &StreamConfig, mut sensor: S) -> Result<Self> {
        let store = match &config.settings_path {
            Some(path) => SettingsStore::new(path),
            None => SettingsStore::in_memory(),
        };
        let stored = store.record_boot()?;
        let mut settings = sensor.settings();
        stored.apply_to(&mut settings);
        sensor.apply_all(&settings)?;
        debug!("Applied {} stored setting overrides", stored.overrides.len());

        let listener = TcpListener::bind(config.bind).await?;
        let registry = Arc::new(ClientRegistry::new());
        let power = Arc::new(PowerController::new());
        let (restart, restart_rx) = mpsc::unbounded_channel();

        let state = Arc::new(AppState {
            sensor: shared(sensor),
            admission: Admission::new(Arc::clone(&registry), Arc::clone(&power)),
            store,
            boot_count: stored.boot_count,
            write_timeout: config.client_write_timeout(),
            restart,
        });
        let cancel = CancellationToken::new();
        let handle = ServerHandle { registry, power, sync: Arc::new(FrameSync::new()), cancel: cancel.clone() };

        info!(
            "Camera server bound to {} ({} fps, up to {} stream clients)",
            listener.local_addr()?,
            config.frame_rate,
            handle.registry.capacity()
        );

        Ok(Self {
            listener,
            state,
            handle,
            pools: MemoryPools::new(config.memory),
            frame_ready: Arc::new(Notify::new()),
            period: config.frame_period(),
            restart_rx,
            _cancel_on_drop: cancel.drop_guard(),
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Serve until shut down (returns `Ok`) or until the pipeline must be rebuilt
    /// (returns the fatal error or [`StreamError::RestartRequested`]).
    pub async fn run(self) -> Result<()> {
        let Self { listener, state, handle, pools, frame_ready, period, mut restart_rx, _cancel_on_drop } = self;
        let cancel = handle.cancel.clone();
        let stopping = cancel.child_token();

        let mut acquisition: JoinHandle<Result<()>> = tokio::spawn(
            AcquisitionWorker::new(
                Arc::clone(&state.sensor),
                Arc::clone(&handle.sync),
                pools,
                Arc::clone(&handle.power),
                Arc::clone(&frame_ready),
                period,
            )
            .run(stopping.clone()),
        );
        let mut dispatcher: JoinHandle<Result<()>> = tokio::spawn(
            DispatchWorker::new(
                Arc::clone(&handle.registry),
                Arc::clone(&handle.sync),
                Arc::clone(&handle.power),
                frame_ready,
                period,
            )
            .run(stopping.clone()),
        );

        let app = http::router(state);
        let graceful = stopping.clone();
        let mut server: JoinHandle<std::io::Result<()>> = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { graceful.cancelled().await })
                .await
        });

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Camera server shutting down");
                Ok(())
            }
            reason = restart_rx.recv() => {
                let reason = reason.unwrap_or_else(|| "control channel closed".to_string());
                Err(StreamError::restart_requested(reason))
            }
            joined = &mut acquisition => worker_exit("acquisition", joined, &cancel),
            joined = &mut dispatcher => worker_exit("dispatcher", joined, &cancel),
            served = &mut server => match served {
                Ok(Ok(())) => Err(StreamError::restart_requested("HTTP server stopped")),
                Ok(Err(e)) => {
                    error!("HTTP server failed: {}", e);
                    Err(e.into())
                }
                Err(e) => Err(StreamError::restart_requested(format!("HTTP server panicked: {e}"))),
            },
        };

        stopping.cancel();
        if !acquisition.is_finished() {
            let _ = acquisition.await;
        }
        if !dispatcher.is_finished() {
            let _ = dispatcher.await;
        }
        // Ending the stream bodies lets their connections close
        let dropped = handle.registry.drain().len();
        if dropped > 0 {
            debug!("Closed {} stream clients", dropped);
        }
        if !server.is_finished() && tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await.is_err() {
            warn!("Connections still open after {:?}, closing them", SHUTDOWN_GRACE);
            server.abort();
            let _ = server.await;
        }

        if let Err(e) = &outcome {
            warn!("Pipeline stopped: {}", e);
        }
        outcome
    }
}

fn worker_exit(
    worker: &str,
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
    cancel: &CancellationToken,
) -> Result<()> {
    match joined {
        Ok(Ok(())) if cancel.is_cancelled() => Ok(()),
        Ok(Ok(())) => Err(StreamError::restart_requested(format!("{worker} worker exited"))),
        Ok(Err(e)) => {
            error!("{} worker failed: {}", worker, e);
            Err(e)
        }
        Err(e) => Err(StreamError::restart_requested(format!("{worker} worker panicked: {e}"))),
    }
}
