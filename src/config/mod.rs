pub mod settings;

pub use settings::{ClientConfig, Config, ServerConfig};
