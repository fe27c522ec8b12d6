//! tiercache-bootstrap - 缓存进程启动骨架
//!
//! 配置 -> tracing -> 远程存储（带连接重试）-> 缓存管理器 -> 优雅关闭

mod infrastructure;
mod runtime;
mod shutdown;
mod starter;

pub use infrastructure::*;
pub use runtime::*;
pub use shutdown::*;
pub use starter::*;
