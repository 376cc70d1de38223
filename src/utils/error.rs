use thiserror::Error;

use crate::modbus::frame::ExceptionCode;

#[derive(Error, Debug)]
pub enum ModbusError {
    #[error("Connection refused: {0}")]
    ConnectRefused(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server exception: {0}")]
    Exception(ExceptionCode),

    #[error("Invalid parameter: {0}")]
    Validation(String),

    #[error("Lock acquisition failed")]
    LockError,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ModbusError {
    /// Transport failures tear down the connection; everything else is
    /// terminal for the single request only.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            ModbusError::ConnectRefused(_) | ModbusError::ConnectionLost(_)
        )
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        ModbusError::ConnectionLost(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        ModbusError::ConfigError(format!("JSON error: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ModbusError::Timeout
    }
}
