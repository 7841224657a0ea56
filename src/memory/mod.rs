pub mod store;

pub use store::{ConsolidatedTurn, MemoryError, MemoryStore, SearchResult};
