pub mod pressure_sensor;

pub use pressure_sensor::{DriftHandle, PressureSensor};
