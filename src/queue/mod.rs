pub mod store;
pub mod worker;

pub use store::{QueueError, QueueStore, Task, TaskStatus, Worker, WorkerStatus};
pub use worker::render_command_argv;
