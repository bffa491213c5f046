//! 设备驱动模块，包含 IDE 磁盘驱动与用于宿主环境的内存磁盘控制器

use std::fmt;

use crate::fs::BufData;

pub mod ide;
pub mod ramdisk;

pub use ide::{Disk, TaskFile};
pub use ramdisk::{RamDisk, RamDiskConfig, Transfer};

/// 设备中断到来时由控制器调用的处理函数
pub type IrqHandler = Box<dyn Fn() + Send + Sync>;

/// 磁盘控制器在状态寄存器中报告的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    /// 驱动器故障（DF 位）
    DriveFault,
    /// 命令执行出错（ERR 位）
    CommandError,
}

impl fmt::Display for DiskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskError::DriveFault => write!(f, "drive fault"),
            DiskError::CommandError => write!(f, "command error"),
        }
    }
}

impl std::error::Error for DiskError {}

/// 块设备控制器，IDE 驱动通过它向硬件下发命令。
///
/// 控制器一次只处理一条命令：`issue` 下发后，控制器在完成传输时调用
/// `init` 注册的中断处理函数；处理函数调用 `finish` 确认完成，
/// 之后才可以下发下一条命令。
pub trait BlockDevice: Send + Sync {
    /// 注册中断处理函数并让控制器进入就绪状态
    fn init(&self, irq: IrqHandler);

    /// 从盘（drive 1）是否存在
    fn has_disk1(&self) -> bool;

    /// 写任务文件寄存器并启动命令；写命令同时给出要写出的数据
    fn issue(&self, cmd: TaskFile, data: Option<&BufData>);

    /// 确认当前命令完成。读命令把扇区数据拷贝到 `data`
    fn finish(&self, data: Option<&mut BufData>) -> Result<(), DiskError>;
}
