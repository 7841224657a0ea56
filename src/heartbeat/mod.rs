pub mod runner;

pub use runner::{is_effectively_empty, HeartbeatAgent, HeartbeatLoop, ProactiveSink, TelegramProactiveSink, HEARTBEAT_OK};
