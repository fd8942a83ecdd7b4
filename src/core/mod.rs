//! 宿主支撑：启动错误与优雅关闭

pub mod error;
pub mod shutdown;

pub use error::WorkerError;
pub use shutdown::{ShutdownCoordinator, ShutdownManager, ShutdownReason};
