//! ports - 抽象 trait 层
//!
//! 定义缓存契约、远程存储协作者接口、序列化器和同步事件

mod cache;
mod event;
mod key_generator;
mod remote_store;
mod serializer;

pub use cache::*;
pub use event::*;
pub use key_generator::*;
pub use remote_store::*;
pub use serializer::*;
