//! Sensor driver trait for frame sources

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::Result;
use crate::settings::{SensorSettings, Setting};

/// Trait for image sensors producing encoded JPEG frames
///
/// Drivers own their frame buffer; `capture` returns a borrow of it that stays valid
/// until the next call. The pipeline copies what it needs before capturing again.
#[async_trait::async_trait]
pub trait SensorDriver: Send + 'static {
    /// Capture one encoded frame.
    ///
    /// Errors are not retried by the pipeline; the cycle is skipped and the previously
    /// published frame stays visible.
    async fn capture(&mut self) -> Result<&[u8]>;

    /// Apply one validated setting to the hardware.
    fn apply(&mut self, setting: Setting, value: i32) -> Result<()>;

    /// Settings currently in effect
    fn settings(&self) -> SensorSettings;

    /// Apply every value in `settings`.
    fn apply_all(&mut self, settings: &SensorSettings) -> Result<()> {
        for (setting, value) in settings.iter() {
            self.apply(setting, value)?;
        }
        Ok(())
    }
}

/// A sensor shared between the acquisition worker, the single-frame endpoint and the
/// settings endpoints.
pub type SharedSensor<S> = Arc<Mutex<S>>;

/// Wrap a driver for sharing.
pub fn shared<S: SensorDriver>(sensor: S) -> SharedSensor<S> {
    Arc::new(Mutex::new(sensor))
}
