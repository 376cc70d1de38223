pub mod poll_service;
pub mod server_service;

pub use poll_service::{PollService, WatchHandle, WatchUpdate};
pub use server_service::ModbusServer;
