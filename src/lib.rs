
pub mod endpoint;
pub mod framed_socket;
pub mod host;
pub mod messages;
pub mod promise;
pub mod proxy;
pub mod proxy_socket;
pub mod spawn;
pub mod task;
pub mod taskmaster;
pub mod transport;
pub mod worker;
mod sys;
mod worker_instance;

pub use task::{Task, TaskFactory, TaskRegistry};
pub use taskmaster::Taskmaster;
pub use worker::{Worker, WorkerStatus};
