//! 文件系统的块缓存层
//!
//! 上层（日志、索引节点、目录）只通过 [`Bcache`] 与 [`Buf`] 访问磁盘块。

mod bio;

pub use bio::{Bcache, Buf, BufData, BufFlags, BufInfo};
pub(crate) use bio::BufInner;
