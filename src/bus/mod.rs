pub mod events;
pub mod queue;

pub use events::{InboundMessage, OutboundMessage, StreamingEdit};
pub use queue::{MessageBus, RateLimiter};
