pub mod config;
pub mod engine;
pub mod handlers;
pub mod router;

pub use config::{Cli, ServerConfig};
pub use engine::Engine;
pub use router::app_router;
