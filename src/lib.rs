//! Modbus TCP Client/Server Core
//!
//! This library provides the protocol core behind a Modbus TCP demo pair:
//! a client with transaction matching and periodic watches, and a server
//! simulating a virtual device (a PT-100 pressure sensor) with drifting
//! register values. Framing, codec and register storage are implemented
//! here; presentation is left to external collaborators.

pub mod cli;
pub mod config;
pub mod devices;
pub mod modbus;
pub mod output;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use devices::PressureSensor;
pub use modbus::{
    BankLayout, BankValues, ExceptionCode, FunctionCode, ModbusClient, ModbusClientTrait,
    RegisterBank, RegisterStore,
};
pub use output::{ConsoleFormatter, JsonFormatter, UpdateFormatter};
pub use services::{ModbusServer, PollService, WatchHandle, WatchUpdate};
pub use utils::error::ModbusError;

pub const VERSION: &str = "0.1.0";
