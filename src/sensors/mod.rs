//! Sensor driver implementations usable without camera hardware

pub mod directory;
pub mod synthetic;

pub use directory::DirectorySensor;
pub use synthetic::SyntheticSensor;
