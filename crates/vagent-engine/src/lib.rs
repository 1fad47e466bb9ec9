//! Process binary wiring the media, control-plane and provider crates into a
//! running voice agent (§4.10). See `engine::Engine` for the conversation
//! state machine and `main.rs` for process bootstrap.

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod observability;
pub mod providers;

pub use config::AppConfig;
pub use engine::Engine;
pub use error::EngineError;
