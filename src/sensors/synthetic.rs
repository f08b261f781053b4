//! Synthetic sensor producing JPEG-shaped frames without hardware

use tokio::time::Duration;
use tracing::trace;

use crate::Result;
use crate::sensor::SensorDriver;
use crate::settings::{SensorSettings, Setting};

/// Bytes of the sequence marker at each end of a synthetic frame.
pub const MARKER_LEN: usize = 8;

/// Sensor that fabricates frames sized by the current resolution and quality.
///
/// Each frame is `FF D8`, the capture sequence number as a big-endian `u64`, filler
/// bytes, the sequence number again, then `FF D9`. A reader can check a frame for
/// consistency with [`SyntheticSensor::frame_sequence`]. The fabricated size is a
/// fraction (`scale`) of [`SensorSettings::encoded_size_hint`], jittered per frame so
/// buffer growth gets exercised.
pub struct SyntheticSensor {
    settings: SensorSettings,
    frame: Vec<u8>,
    sequence: u64,
    scale: f64,
    exposure: Duration,
}

impl Default for SyntheticSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticSensor {
    pub fn new() -> Self {
        Self {
            settings: SensorSettings::default(),
            frame: Vec::new(),
            sequence: 0,
            scale: 0.1,
            exposure: Duration::ZERO,
        }
    }

    /// Fraction of the size hint each frame occupies.
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale.clamp(0.0001, 1.0);
        self
    }

    /// Simulated readout time spent in every capture.
    pub fn with_exposure(mut self, exposure: Duration) -> Self {
        self.exposure = exposure;
        self
    }

    /// Frames captured so far
    pub fn captures(&self) -> u64 {
        self.sequence
    }

    fn frame_len(&self) -> usize {
        let base = (self.settings.encoded_size_hint() as f64 * self.scale) as usize;
        // +/- 12.5% jitter, deterministic per sequence number
        let jitter = (self.sequence.wrapping_mul(2_654_435_761) % 256) as usize;
        let len = base * 7 / 8 + base * jitter / 1024;
        len.max(2 * MARKER_LEN + 4)
    }

    /// Sequence number of a synthetic frame, if both markers agree and the filler is
    /// consistent with it.
    pub fn frame_sequence(frame: &[u8]) -> Option<u64> {
        let n = frame.len();
        if n < 2 * MARKER_LEN + 4 || frame[..2] != [0xFF, 0xD8] || frame[n - 2..] != [0xFF, 0xD9] {
            return None;
        }
        let head = u64::from_be_bytes(frame[2..2 + MARKER_LEN].try_into().ok()?);
        let tail = u64::from_be_bytes(frame[n - 2 - MARKER_LEN..n - 2].try_into().ok()?);
        let fill = filler(head);
        let body = &frame[2 + MARKER_LEN..n - 2 - MARKER_LEN];
        (head == tail && body.iter().all(|&b| b == fill)).then_some(head)
    }
}

fn filler(sequence: u64) -> u8 {
    // Never 0xFF so the body cannot contain a JPEG marker
    (sequence % 0xFF) as u8
}

#[async_trait::async_trait]
impl SensorDriver for SyntheticSensor {
    async fn capture(&mut self) -> Result<&[u8]> {
        if !self.exposure.is_zero() {
            tokio::time::sleep(self.exposure).await;
        }

        self.sequence += 1;
        let len = self.frame_len();
        let marker = self.sequence.to_be_bytes();

        self.frame.clear();
        self.frame.extend_from_slice(&[0xFF, 0xD8]);
        self.frame.extend_from_slice(&marker);
        self.frame.resize(len - 2 - MARKER_LEN, filler(self.sequence));
        self.frame.extend_from_slice(&marker);
        self.frame.extend_from_slice(&[0xFF, 0xD9]);

        trace!(sequence = self.sequence, len, "Synthetic frame captured");
        Ok(&self.frame)
    }

    fn apply(&mut self, setting: Setting, value: i32) -> Result<()> {
        self.settings.set(setting, value)
    }

    fn settings(&self) -> SensorSettings {
        self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_carry_consistent_markers() {
        let mut sensor = SyntheticSensor::new().with_scale(0.01);
        for expected in 1..=5u64 {
            let frame = sensor.capture().await.unwrap().to_vec();
            assert_eq!(SyntheticSensor::frame_sequence(&frame), Some(expected));
        }
        assert_eq!(sensor.captures(), 5);
    }

    #[tokio::test]
    async fn torn_frames_are_detected() {
        let mut sensor = SyntheticSensor::new().with_scale(0.01);
        let first = sensor.capture().await.unwrap().to_vec();
        let second = sensor.capture().await.unwrap().to_vec();

        let half = first.len().min(second.len()) / 2;
        let mut torn = second[..half].to_vec();
        torn.extend_from_slice(&first[half..]);
        assert_eq!(SyntheticSensor::frame_sequence(&torn), None);
    }

    #[tokio::test]
    async fn quality_changes_frame_size() {
        let mut sensor = SyntheticSensor::new().with_scale(0.05);
        let large = sensor.capture().await.unwrap().len();

        sensor.apply(Setting::FrameSize, 5).unwrap();
        sensor.apply(Setting::Quality, 10).unwrap();
        let small = sensor.capture().await.unwrap().len();
        assert!(small < large, "{small} should be below {large}");
        assert_eq!(sensor.settings().quality, 10);
    }

    #[test]
    fn apply_rejects_out_of_range() {
        let mut sensor = SyntheticSensor::new();
        assert!(sensor.apply(Setting::SpecialEffect, 9).is_err());
        assert_eq!(sensor.settings().special_effect, 0);
    }
}
