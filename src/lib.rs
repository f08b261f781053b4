//! Double-buffered camera capture with a round-robin MJPEG stream multiplexer.
//!
//! framecast captures compressed frames from an image sensor and serves them to up to
//! [`CLIENT_CAPACITY`] clients at once as an HTTP `multipart/x-mixed-replace` stream.
//!
//! # Architecture
//!
//! - **Acquisition** ([`AcquisitionWorker`]): captures one frame per period into the slot
//!   it owns, then swaps it into the [`FrameSync`] synchronizer.
//! - **Synchronizer** ([`FrameSync`]): a single token guarding the published frame. A
//!   frame being sent to a client is never overwritten mid-send.
//! - **Registry** ([`ClientRegistry`]): bounded FIFO of stream clients.
//! - **Dispatch** ([`DispatchWorker`]): serves the client at the head of the queue one
//!   part per cycle and re-enqueues it, so K clients share the frame rate evenly.
//! - **Admission** ([`Admission`]): enrolls stream requests and wakes idle workers.
//! - **Power** ([`PowerController`]): both workers suspend themselves when nobody is
//!   watching and are only woken by admission.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use framecast::config::StreamConfig;
//! use framecast::sensors::SyntheticSensor;
//! use framecast::server::StreamServer;
//!
//! #[tokio::main]
//! async fn main() -> framecast::Result<()> {
//!     let config = StreamConfig { bind: "127.0.0.1:8080".parse().unwrap(), ..Default::default() };
//!     let server = StreamServer::bind(&config, SyntheticSensor::new()).await?;
//!     // Stream at http://127.0.0.1:8080/mjpeg/1
//!     server.run().await
//! }
//! ```

pub mod acquisition;
pub mod config;
mod error;
pub mod frame;
pub mod http;
pub mod memory;
pub mod power;
pub mod registry;
pub mod sensor;
pub mod sensors;
pub mod server;
pub mod settings;
pub mod stream;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;

pub use error::*;

pub use acquisition::AcquisitionWorker;
pub use frame::{FrameLease, FrameSlot, FrameSync};
pub use memory::{MemoryBudget, MemoryPools, Pool, PooledBuffer};
pub use power::{PowerController, PowerState, PowerStates, Worker};
pub use registry::{CLIENT_CAPACITY, ClientConnection, ClientId, ClientRegistry, Transport};
pub use sensor::SensorDriver;
pub use settings::{SensorSettings, Setting, SettingsStore};
pub use stream::{Admission, BodySender, Dispatch, DispatchWorker};
