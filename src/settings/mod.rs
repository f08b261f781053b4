//! Sensor capture parameters.
//!
//! The sensor exposes a fixed set of numeric controls. [`Setting`] names each of them,
//! knows its key on the wire and its valid range, and [`SensorSettings`] holds one value
//! per setting. Lookup by key is a closed match, not a string-keyed table.
//!
//! `quality` is on the user scale (10 = smallest files, 63 = best); the sensor's JPEG
//! quantiser register runs the other way and is derived by [`SensorSettings::jpeg_register`].

mod store;

pub use store::{PersistedState, SettingsStore};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Result, StreamError};

/// Sensor resolution classes, indexed the way the sensor driver numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSize {
    R96x96,
    Qqvga,
    Qcif,
    Hqvga,
    R240x240,
    Qvga,
    Cif,
    Hvga,
    Vga,
    Svga,
    Xga,
    Hd,
    Sxga,
    Uxga,
}

impl FrameSize {
    const ALL: [FrameSize; 14] = [
        FrameSize::R96x96,
        FrameSize::Qqvga,
        FrameSize::Qcif,
        FrameSize::Hqvga,
        FrameSize::R240x240,
        FrameSize::Qvga,
        FrameSize::Cif,
        FrameSize::Hvga,
        FrameSize::Vga,
        FrameSize::Svga,
        FrameSize::Xga,
        FrameSize::Hd,
        FrameSize::Sxga,
        FrameSize::Uxga,
    ];

    /// Resolution class for a driver index.
    pub fn from_index(index: i32) -> Option<Self> {
        usize::try_from(index).ok().and_then(|i| Self::ALL.get(i).copied())
    }

    /// Width and height in pixels
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            FrameSize::R96x96 => (96, 96),
            FrameSize::Qqvga => (160, 120),
            FrameSize::Qcif => (176, 144),
            FrameSize::Hqvga => (240, 176),
            FrameSize::R240x240 => (240, 240),
            FrameSize::Qvga => (320, 240),
            FrameSize::Cif => (400, 296),
            FrameSize::Hvga => (480, 320),
            FrameSize::Vga => (640, 480),
            FrameSize::Svga => (800, 600),
            FrameSize::Xga => (1024, 768),
            FrameSize::Hd => (1280, 720),
            FrameSize::Sxga => (1280, 1024),
            FrameSize::Uxga => (1600, 1200),
        }
    }
}

/// Every adjustable sensor parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Setting {
    FrameSize,
    Quality,
    Brightness,
    Contrast,
    Saturation,
    GainCeiling,
    ColorBar,
    AutoWhiteBalance,
    AutoGainControl,
    AutoExposureControl,
    HorizontalMirror,
    VerticalFlip,
    AwbGain,
    AgcGain,
    AecValue,
    Aec2,
    Downsize,
    BlackPixelCorrection,
    WhitePixelCorrection,
    RawGamma,
    LensCorrection,
    SpecialEffect,
    WhiteBalanceMode,
    AeLevel,
}

impl Setting {
    pub const ALL: [Setting; 24] = [
        Setting::FrameSize,
        Setting::Quality,
        Setting::Brightness,
        Setting::Contrast,
        Setting::Saturation,
        Setting::GainCeiling,
        Setting::ColorBar,
        Setting::AutoWhiteBalance,
        Setting::AutoGainControl,
        Setting::AutoExposureControl,
        Setting::HorizontalMirror,
        Setting::VerticalFlip,
        Setting::AwbGain,
        Setting::AgcGain,
        Setting::AecValue,
        Setting::Aec2,
        Setting::Downsize,
        Setting::BlackPixelCorrection,
        Setting::WhitePixelCorrection,
        Setting::RawGamma,
        Setting::LensCorrection,
        Setting::SpecialEffect,
        Setting::WhiteBalanceMode,
        Setting::AeLevel,
    ];

    /// Key used by the control endpoints and the settings file.
    pub fn key(self) -> &'static str {
        match self {
            Setting::FrameSize => "framesize",
            Setting::Quality => "quality",
            Setting::Brightness => "brightness",
            Setting::Contrast => "contrast",
            Setting::Saturation => "saturation",
            Setting::GainCeiling => "gainceiling",
            Setting::ColorBar => "colorbar",
            Setting::AutoWhiteBalance => "awb",
            Setting::AutoGainControl => "agc",
            Setting::AutoExposureControl => "aec",
            Setting::HorizontalMirror => "hmirror",
            Setting::VerticalFlip => "vflip",
            Setting::AwbGain => "awb_gain",
            Setting::AgcGain => "agc_gain",
            Setting::AecValue => "aec_value",
            Setting::Aec2 => "aec2",
            Setting::Downsize => "dcw",
            Setting::BlackPixelCorrection => "bpc",
            Setting::WhitePixelCorrection => "wpc",
            Setting::RawGamma => "raw_gma",
            Setting::LensCorrection => "lenc",
            Setting::SpecialEffect => "special_effect",
            Setting::WhiteBalanceMode => "wb_mode",
            Setting::AeLevel => "ae_level",
        }
    }

    /// Inclusive valid range
    pub fn range(self) -> (i32, i32) {
        match self {
            Setting::FrameSize => (0, 13),
            Setting::Quality => (10, 63),
            Setting::Brightness | Setting::Contrast | Setting::Saturation | Setting::AeLevel => {
                (-2, 2)
            }
            Setting::GainCeiling | Setting::SpecialEffect => (0, 6),
            Setting::AgcGain => (0, 30),
            Setting::AecValue => (0, 1200),
            Setting::WhiteBalanceMode => (0, 4),
            Setting::ColorBar
            | Setting::AutoWhiteBalance
            | Setting::AutoGainControl
            | Setting::AutoExposureControl
            | Setting::HorizontalMirror
            | Setting::VerticalFlip
            | Setting::AwbGain
            | Setting::Aec2
            | Setting::Downsize
            | Setting::BlackPixelCorrection
            | Setting::WhitePixelCorrection
            | Setting::RawGamma
            | Setting::LensCorrection => (0, 1),
        }
    }

    /// Check `value` against the range.
    pub fn validate(self, value: i32) -> Result<i32> {
        let (min, max) = self.range();
        if (min..=max).contains(&value) {
            Ok(value)
        } else {
            Err(StreamError::InvalidSetting { key: self.key(), value, min, max })
        }
    }
}

impl FromStr for Setting {
    type Err = StreamError;

    fn from_str(key: &str) -> Result<Self> {
        Setting::ALL
            .into_iter()
            .find(|s| s.key() == key)
            .ok_or_else(|| StreamError::UnknownSetting { key: key.to_string() })
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// One value per [`Setting`]. Serialises as a flat key/value document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    pub framesize: i32,
    pub quality: i32,
    pub brightness: i32,
    pub contrast: i32,
    pub saturation: i32,
    pub gainceiling: i32,
    pub colorbar: i32,
    pub awb: i32,
    pub agc: i32,
    pub aec: i32,
    pub hmirror: i32,
    pub vflip: i32,
    pub awb_gain: i32,
    pub agc_gain: i32,
    pub aec_value: i32,
    pub aec2: i32,
    pub dcw: i32,
    pub bpc: i32,
    pub wpc: i32,
    pub raw_gma: i32,
    pub lenc: i32,
    pub special_effect: i32,
    pub wb_mode: i32,
    pub ae_level: i32,
}

impl Default for SensorSettings {
    /// Power-on state: UXGA at the best JPEG quality.
    fn default() -> Self {
        Self {
            framesize: 13,
            quality: 63,
            brightness: 0,
            contrast: 0,
            saturation: 0,
            gainceiling: 0,
            colorbar: 0,
            awb: 1,
            agc: 1,
            aec: 1,
            hmirror: 0,
            vflip: 0,
            awb_gain: 1,
            agc_gain: 0,
            aec_value: 168,
            aec2: 0,
            dcw: 1,
            bpc: 0,
            wpc: 1,
            raw_gma: 1,
            lenc: 1,
            special_effect: 0,
            wb_mode: 0,
            ae_level: 0,
        }
    }
}

impl SensorSettings {
    fn field_mut(&mut self, setting: Setting) -> &mut i32 {
        match setting {
            Setting::FrameSize => &mut self.framesize,
            Setting::Quality => &mut self.quality,
            Setting::Brightness => &mut self.brightness,
            Setting::Contrast => &mut self.contrast,
            Setting::Saturation => &mut self.saturation,
            Setting::GainCeiling => &mut self.gainceiling,
            Setting::ColorBar => &mut self.colorbar,
            Setting::AutoWhiteBalance => &mut self.awb,
            Setting::AutoGainControl => &mut self.agc,
            Setting::AutoExposureControl => &mut self.aec,
            Setting::HorizontalMirror => &mut self.hmirror,
            Setting::VerticalFlip => &mut self.vflip,
            Setting::AwbGain => &mut self.awb_gain,
            Setting::AgcGain => &mut self.agc_gain,
            Setting::AecValue => &mut self.aec_value,
            Setting::Aec2 => &mut self.aec2,
            Setting::Downsize => &mut self.dcw,
            Setting::BlackPixelCorrection => &mut self.bpc,
            Setting::WhitePixelCorrection => &mut self.wpc,
            Setting::RawGamma => &mut self.raw_gma,
            Setting::LensCorrection => &mut self.lenc,
            Setting::SpecialEffect => &mut self.special_effect,
            Setting::WhiteBalanceMode => &mut self.wb_mode,
            Setting::AeLevel => &mut self.ae_level,
        }
    }

    pub fn get(&self, setting: Setting) -> i32 {
        match setting {
            Setting::FrameSize => self.framesize,
            Setting::Quality => self.quality,
            Setting::Brightness => self.brightness,
            Setting::Contrast => self.contrast,
            Setting::Saturation => self.saturation,
            Setting::GainCeiling => self.gainceiling,
            Setting::ColorBar => self.colorbar,
            Setting::AutoWhiteBalance => self.awb,
            Setting::AutoGainControl => self.agc,
            Setting::AutoExposureControl => self.aec,
            Setting::HorizontalMirror => self.hmirror,
            Setting::VerticalFlip => self.vflip,
            Setting::AwbGain => self.awb_gain,
            Setting::AgcGain => self.agc_gain,
            Setting::AecValue => self.aec_value,
            Setting::Aec2 => self.aec2,
            Setting::Downsize => self.dcw,
            Setting::BlackPixelCorrection => self.bpc,
            Setting::WhitePixelCorrection => self.wpc,
            Setting::RawGamma => self.raw_gma,
            Setting::LensCorrection => self.lenc,
            Setting::SpecialEffect => self.special_effect,
            Setting::WhiteBalanceMode => self.wb_mode,
            Setting::AeLevel => self.ae_level,
        }
    }

    /// Set one value after range validation.
    pub fn set(&mut self, setting: Setting, value: i32) -> Result<()> {
        *self.field_mut(setting) = setting.validate(value)?;
        Ok(())
    }

    /// All settings as (setting, value) pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (Setting, i32)> + '_ {
        Setting::ALL.into_iter().map(move |s| (s, self.get(s)))
    }

    /// Resolution class currently selected.
    pub fn frame_size(&self) -> FrameSize {
        FrameSize::from_index(self.framesize).unwrap_or(FrameSize::Uxga)
    }

    /// Value for the sensor's JPEG quantiser register (0 = best).
    pub fn jpeg_register(&self) -> u8 {
        (63 - self.quality.clamp(0, 63)) as u8
    }

    /// Upper estimate of one encoded frame's size at the current resolution and quality.
    ///
    /// Roughly 1.5 bits per pixel at the best quality, scaling down with the quantiser.
    pub fn encoded_size_hint(&self) -> usize {
        let (width, height) = self.frame_size().dimensions();
        let pixels = width as usize * height as usize;
        let quality = self.quality.clamp(10, 63) as usize;
        (pixels * 3 / 16) * quality / 63 + 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn keys_round_trip_and_are_unique() {
        let mut keys: Vec<&str> = Setting::ALL.iter().map(|s| s.key()).collect();
        for setting in Setting::ALL {
            assert_eq!(setting.key().parse::<Setting>().unwrap(), setting);
        }
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), Setting::ALL.len());
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = "fps".parse::<Setting>().unwrap_err();
        assert!(matches!(err, StreamError::UnknownSetting { ref key } if key == "fps"));
    }

    #[test]
    fn defaults_are_in_range() {
        let settings = SensorSettings::default();
        for (setting, value) in settings.iter() {
            assert!(setting.validate(value).is_ok(), "{setting} default {value} out of range");
        }
        assert_eq!(settings.frame_size(), FrameSize::Uxga);
        assert_eq!(settings.jpeg_register(), 0);
    }

    #[test]
    fn serialises_as_flat_document() {
        let json = serde_json::to_value(SensorSettings::default()).unwrap();
        let object = json.as_object().unwrap();
        assert_eq!(object.len(), Setting::ALL.len());
        for setting in Setting::ALL {
            assert!(object.contains_key(setting.key()), "missing {setting}");
        }
    }

    #[test]
    fn get_reads_the_field_named_by_the_key() {
        let mut settings = SensorSettings::default();
        for (offset, setting) in Setting::ALL.into_iter().enumerate() {
            let (min, max) = setting.range();
            settings.set(setting, min + offset as i32 % (max - min + 1)).unwrap();
        }

        let json = serde_json::to_value(settings).unwrap();
        for setting in Setting::ALL {
            assert_eq!(json[setting.key()], settings.get(setting), "{setting}");
        }
    }

    #[test]
    fn quality_drives_the_size_hint() {
        let mut settings = SensorSettings::default();
        let best = settings.encoded_size_hint();
        settings.set(Setting::Quality, 10).unwrap();
        assert!(settings.encoded_size_hint() < best);
        assert_eq!(settings.jpeg_register(), 53);

        settings.set(Setting::FrameSize, 5).unwrap();
        assert_eq!(settings.frame_size().dimensions(), (320, 240));
    }

    proptest! {
        #[test]
        fn set_respects_ranges(index in 0usize..24, value in -2000i32..2000i32) {
            let setting = Setting::ALL[index];
            let mut settings = SensorSettings::default();
            let before = settings;
            let (min, max) = setting.range();

            match settings.set(setting, value) {
                Ok(()) => {
                    prop_assert!((min..=max).contains(&value));
                    prop_assert_eq!(settings.get(setting), value);
                }
                Err(_) => {
                    prop_assert!(!(min..=max).contains(&value));
                    prop_assert_eq!(settings, before);
                }
            }
        }
    }
}
