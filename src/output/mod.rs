pub mod formatters;

pub use formatters::{ConsoleFormatter, JsonFormatter, UpdateFormatter};
