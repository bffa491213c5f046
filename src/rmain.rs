//! 内核启动入口，按依赖顺序构造块 I/O 各层。

use std::sync::Arc;

use crate::driver::{BlockDevice, Disk};
use crate::fs::Bcache;

/// 启动完成的块 I/O 子系统。
///
/// 字段的构造顺序即初始化顺序：先初始化磁盘驱动（注册中断、探测从盘），
/// 再建立缓冲区缓存。丢弃 `Kernel` 即完成拆除，此时不应再有未释放的缓冲块。
pub struct Kernel {
    pub disk: Arc<Disk>,
    pub bcache: Bcache,
}

impl Kernel {
    /// 在给定的磁盘控制器上启动块 I/O 子系统
    pub fn boot<D: BlockDevice + 'static>(device: Arc<D>) -> Self {
        log::info!("xv6-bio is booting");

        let disk = Disk::new(device);
        disk.init(); // 磁盘驱动
        let bcache = Bcache::new(Arc::clone(&disk)); // 缓冲区缓存

        #[cfg(feature = "verbose_init_info")]
        println!(
            "bcache: {} buffers of {} bytes over a {} block disk",
            bcache.capacity(),
            crate::consts::fs::BSIZE,
            crate::consts::fs::FSSIZE
        );

        Self { disk, bcache }
    }
}
