//! Test utilities shared by the pipeline's unit tests and benchmarks
//!
//! Sensors with scripted failures, in-memory stream clients and a collector that parses
//! what a client would have received.

#![cfg(any(test, feature = "benchmark"))]

use std::sync::Arc;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::task::JoinHandle;

use crate::memory::{MemoryBudget, MemoryPools};
use crate::registry::ClientConnection;
use crate::sensor::SensorDriver;
use crate::sensors::SyntheticSensor;
use crate::settings::{SensorSettings, Setting};
use crate::stream::multipart::PartReader;
use crate::{Result, StreamError};

/// Synthetic sensor that fails every `fail_every`-th capture.
pub struct FlakySensor {
    inner: SyntheticSensor,
    attempts: u64,
    fail_every: u64,
}

impl FlakySensor {
    pub fn new(fail_every: u64) -> Self {
        Self { inner: SyntheticSensor::new().with_scale(0.01), attempts: 0, fail_every: fail_every.max(1) }
    }

    /// Capture attempts, failed ones included
    pub fn attempts(&self) -> u64 {
        self.attempts
    }
}

#[async_trait::async_trait]
impl SensorDriver for FlakySensor {
    async fn capture(&mut self) -> Result<&[u8]> {
        self.attempts += 1;
        if self.attempts % self.fail_every == 0 {
            return Err(StreamError::sensor_failed(format!("scripted failure #{}", self.attempts)));
        }
        self.inner.capture().await
    }

    fn apply(&mut self, setting: Setting, value: i32) -> Result<()> {
        self.inner.apply(setting, value)
    }

    fn settings(&self) -> SensorSettings {
        self.inner.settings()
    }
}

/// Pools large enough that tests never run out.
pub fn roomy_pools() -> Arc<MemoryPools> {
    MemoryPools::new(MemoryBudget { internal_bytes: 4 << 20, external_bytes: 0 })
}

/// A stream client backed by an in-memory pipe. The second value is the client's end.
pub fn duplex_client(buffer: usize) -> (ClientConnection<DuplexStream>, DuplexStream) {
    let (server, client) = tokio::io::duplex(buffer);
    (ClientConnection::new(server), client)
}

/// What a stream client received before its connection closed.
#[derive(Debug, Default)]
pub struct Received {
    pub preamble: bool,
    pub parts: Vec<Vec<u8>>,
    pub malformed: Option<String>,
}

/// Read `client` to EOF in the background, parsing the multipart stream.
pub fn collect_parts(mut client: DuplexStream) -> JoinHandle<Received> {
    tokio::spawn(async move {
        let mut reader = PartReader::new();
        let mut received = Received::default();
        let mut chunk = vec![0u8; 4096];

        loop {
            let n = match client.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            reader.push(&chunk[..n]);

            if !received.preamble {
                received.preamble = reader.take_preamble();
                if !received.preamble {
                    continue;
                }
            }
            loop {
                match reader.next_part() {
                    Ok(Some(part)) => received.parts.push(part),
                    Ok(None) => break,
                    Err(e) => {
                        received.malformed = Some(e);
                        return received;
                    }
                }
            }
        }
        received
    })
}
