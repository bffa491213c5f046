//! xv6 风格的块 I/O 核心：自旋锁、睡眠锁、IDE 磁盘请求队列与缓冲区缓存。

#![warn(rust_2018_idioms)]

#[macro_use]
extern crate bitflags;

#[macro_use]
pub mod printf;

pub mod consts;
pub mod driver;
pub mod fs;
pub mod process;
pub mod rmain;
pub mod sleeplock;
pub mod spinlock;

pub use driver::{BlockDevice, Disk, DiskError, RamDisk, RamDiskConfig};
pub use fs::{Bcache, Buf, BufData};
pub use rmain::Kernel;
