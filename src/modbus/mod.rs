pub mod client;
pub mod frame;
pub mod registers;
pub mod transaction;
pub mod transport;

pub use client::{validate_range, ModbusClient, ModbusClientTrait};
pub use frame::{ExceptionCode, FunctionCode, MbapHeader, RegisterBank, Request, ResponseBody};
pub use registers::{BankLayout, BankValues, RegisterStore};
pub use transaction::TransactionManager;
