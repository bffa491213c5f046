//! 内存磁盘控制器
//!
//! 在宿主环境中模拟一个带主盘与可选从盘的 IDE 控制器：
//! 每个驱动器是 `FSSIZE` 个块大小的内存区域。
//! 控制器同一时刻只执行一条命令，命令完成后通过中断处理函数通知驱动。
//!
//! 默认由后台线程完成命令（可设置延迟），
//! 也可以切换为手动模式，由调用者通过 [`RamDisk::raise`] 决定中断何时到来。

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use crate::consts::driver::{NDISK, SECTOR_SIZE};
use crate::consts::fs::{BSIZE, FSSIZE};
use crate::fs::BufData;
use crate::process::WaitChannel;
use crate::spinlock::SpinLock;

use super::{BlockDevice, DiskError, IrqHandler, TaskFile};

/// 内存磁盘的配置
#[derive(Debug, Clone)]
pub struct RamDiskConfig {
    /// 是否存在从盘
    pub disk1: bool,
    /// 后台线程完成每条命令前等待的时间
    pub latency: Duration,
    /// 为真时不启动后台线程，中断只由 [`RamDisk::raise`] 触发
    pub manual_irq: bool,
}

impl Default for RamDiskConfig {
    fn default() -> Self {
        Self {
            disk1: true,
            latency: Duration::ZERO,
            manual_irq: false,
        }
    }
}

/// 控制器完成的一次块传输
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub drive: u32,
    pub blockno: u32,
    pub write: bool,
}

pub struct RamDisk {
    ctrl: Arc<Controller>,
    manual: bool,
}

struct Controller {
    state: SpinLock<CtrlState>,
    /// 有新命令或控制器关闭时唤醒后台线程
    kick: WaitChannel,
    irq: OnceLock<IrqHandler>,
    latency: Duration,
    disk1: bool,
}

struct CtrlState {
    drives: Vec<Vec<u8>>,
    /// 已下发、尚未被 `finish` 确认的命令
    busy: Option<TaskFile>,
    /// `busy` 的传输已执行，中断已经（或即将）发出
    done: bool,
    /// 控制器的扇区缓冲区
    sector_buf: Vec<u8>,
    status: Result<(), DiskError>,
    faults: Vec<(u32, u32)>,
    log: Vec<Transfer>,
    shutdown: bool,
}

impl RamDisk {
    pub fn new(config: RamDiskConfig) -> Arc<Self> {
        let ndrive = if config.disk1 { NDISK } else { 1 };
        let ctrl = Arc::new(Controller {
            state: SpinLock::new(
                CtrlState {
                    drives: (0..ndrive).map(|_| vec![0; FSSIZE * BSIZE]).collect(),
                    busy: None,
                    done: false,
                    sector_buf: vec![0; BSIZE],
                    status: Ok(()),
                    faults: Vec::new(),
                    log: Vec::new(),
                    shutdown: false,
                },
                "ramdisk",
            ),
            kick: WaitChannel::new("ramdisk"),
            irq: OnceLock::new(),
            latency: config.latency,
            disk1: config.disk1,
        });
        Arc::new(Self {
            ctrl,
            manual: config.manual_irq,
        })
    }

    /// 直接写入驱动器内容，不经过控制器，用于准备磁盘镜像
    pub fn load(&self, drive: u32, blockno: u32, data: &[u8]) {
        let mut state = self.ctrl.state.lock();
        let off = Self::offset(&state, drive, blockno);
        let len = data.len().min(BSIZE);
        state.drives[drive as usize][off..off + len].copy_from_slice(&data[..len]);
    }

    /// 直接读出驱动器上某个块的内容
    pub fn dump(&self, drive: u32, blockno: u32) -> Vec<u8> {
        let state = self.ctrl.state.lock();
        let off = Self::offset(&state, drive, blockno);
        state.drives[drive as usize][off..off + BSIZE].to_vec()
    }

    fn offset(state: &CtrlState, drive: u32, blockno: u32) -> usize {
        if drive as usize >= state.drives.len() || blockno as usize >= FSSIZE {
            panic!("ramdisk: no block {} on drive {}", blockno, drive);
        }
        blockno as usize * BSIZE
    }

    /// 之后对该块的传输都报告驱动器故障
    pub fn inject_fault(&self, drive: u32, blockno: u32) {
        self.ctrl.state.lock().faults.push((drive, blockno));
    }

    /// 按完成顺序列出所有传输
    pub fn completed(&self) -> Vec<Transfer> {
        self.ctrl.state.lock().log.clone()
    }

    pub fn reads(&self) -> usize {
        self.ctrl.state.lock().log.iter().filter(|t| !t.write).count()
    }

    pub fn writes(&self) -> usize {
        self.ctrl.state.lock().log.iter().filter(|t| t.write).count()
    }

    /// 已下发但尚未发出中断的命令
    pub fn pending(&self) -> Option<TaskFile> {
        let state = self.ctrl.state.lock();
        match state.done {
            false => state.busy,
            true => None,
        }
    }

    /// 手动模式下完成当前命令并在调用者线程上触发中断。
    /// 没有待完成的命令时返回 `false`。
    pub fn raise(&self) -> bool {
        if !self.manual {
            panic!("ramdisk: raise without manual irq");
        }
        self.ctrl.complete()
    }
}

impl Drop for RamDisk {
    fn drop(&mut self) {
        let mut state = self.ctrl.state.lock();
        state.shutdown = true;
        self.ctrl.kick.wakeup();
        drop(state);
    }
}

impl Controller {
    /// 执行 `busy` 命令的数据传输，然后发出中断
    fn complete(&self) -> bool {
        let mut state = self.state.lock();
        let cmd = match state.busy {
            Some(cmd) if !state.done => cmd,
            _ => return false,
        };
        let drive = cmd.drive();
        let blockno = cmd.sector() / (BSIZE / SECTOR_SIZE) as u32;
        let write = cmd.is_write();

        if state.faults.contains(&(drive, blockno)) {
            state.status = Err(DiskError::DriveFault);
        } else if drive as usize >= state.drives.len() || blockno as usize >= FSSIZE {
            state.status = Err(DiskError::CommandError);
        } else {
            let off = blockno as usize * BSIZE;
            let CtrlState { drives, sector_buf, .. } = &mut *state;
            let block = &mut drives[drive as usize][off..off + BSIZE];
            if write {
                block.copy_from_slice(sector_buf);
            } else {
                sector_buf.copy_from_slice(block);
            }
            state.status = Ok(());
            state.log.push(Transfer { drive, blockno, write });
        }
        state.done = true;
        drop(state);

        match self.irq.get() {
            Some(irq) => irq(),
            None => log::warn!("ramdisk: interrupt with no handler"),
        }
        true
    }

    fn worker(self: Arc<Self>) {
        loop {
            let mut state = self.state.lock();
            while !state.shutdown && (state.busy.is_none() || state.done) {
                self.kick.sleep(state);
                state = self.state.lock();
            }
            if state.shutdown {
                return;
            }
            drop(state);

            if !self.latency.is_zero() {
                thread::sleep(self.latency);
            }
            // 中断处理程序的致命错误已经唤醒并终止了所有提交者
            if panic::catch_unwind(AssertUnwindSafe(|| self.complete())).is_err() {
                log::error!("ramdisk: controller halted");
                return;
            }
        }
    }
}

impl BlockDevice for RamDisk {
    fn init(&self, irq: IrqHandler) {
        if self.ctrl.irq.set(irq).is_err() {
            panic!("ramdisk: init twice");
        }
        if !self.manual {
            let ctrl = Arc::clone(&self.ctrl);
            thread::Builder::new()
                .name("ramdisk".into())
                .spawn(move || ctrl.worker())
                .unwrap_or_else(|e| panic!("ramdisk: spawn controller: {}", e));
        }
        log::info!("ramdisk: {} drive(s) of {} blocks", self.ctrl.state.lock().drives.len(), FSSIZE);
    }

    fn has_disk1(&self) -> bool {
        self.ctrl.disk1
    }

    fn issue(&self, cmd: TaskFile, data: Option<&BufData>) {
        let mut state = self.ctrl.state.lock();
        if state.busy.is_some() {
            panic!("ramdisk: command {:#x} issued while busy", cmd.command);
        }
        if let Some(data) = data {
            state.sector_buf.copy_from_slice(&data[..]);
        }
        state.busy = Some(cmd);
        state.done = false;
        self.ctrl.kick.wakeup();
        drop(state);
    }

    fn finish(&self, data: Option<&mut BufData>) -> Result<(), DiskError> {
        let mut state = self.ctrl.state.lock();
        if state.busy.is_none() || !state.done {
            panic!("ramdisk: finish without completed command");
        }
        state.busy = None;
        state.done = false;
        let status = state.status;
        if let (Ok(()), Some(data)) = (status, data) {
            data.copy_from_slice(&state.sector_buf);
        }
        status
    }
}
