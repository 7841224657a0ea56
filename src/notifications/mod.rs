pub mod store;

pub use store::{NotificationError, NotificationRequest, NotificationRow, NotificationStore};
