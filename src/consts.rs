//! 内核常量配置

pub mod fs {
    /// 单次文件系统操作最多写入的块数
    pub const MAXOPBLOCKS: usize = 10;

    /// 缓冲区缓存中的缓冲块数量
    pub const NBUF: usize = MAXOPBLOCKS * 3;

    /// 块大小（字节）
    pub const BSIZE: usize = 512;

    /// 文件系统（设备）的总块数，块号必须小于该值
    pub const FSSIZE: usize = 1000;

    /// 根文件系统所在的设备号
    pub const ROOTDEV: u32 = 1;
}

pub mod driver {
    /// 磁盘扇区大小（字节）
    pub const SECTOR_SIZE: usize = 512;

    /// IDE 控制器上最多挂载的驱动器数量（主盘 0，从盘 1）
    pub const NDISK: usize = 2;
}
