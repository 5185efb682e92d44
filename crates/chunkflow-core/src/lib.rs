pub mod config;
pub mod duration;

pub use config::{ChunkflowConfig, ClientConfig, ConfigError, DecoderConfig, Separator, ServerConfig};
pub use duration::parse_duration;
