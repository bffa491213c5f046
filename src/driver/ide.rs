//! IDE 磁盘驱动
//!
//! 驱动维护一个先进先出的请求队列：队首请求即当前正在由控制器处理的请求。
//! [`Disk::rw`] 把请求挂到队尾，若队列原本为空则立即启动；
//! 控制器完成后触发中断，[`Disk::intr`] 摘下队首、标记缓冲块、唤醒等待者，
//! 再启动下一个请求。请求节点位于提交者的栈上，提交者在请求完成前不会返回。

use bit_field::BitField;

use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::consts::driver::SECTOR_SIZE;
use crate::consts::fs::{BSIZE, FSSIZE};
use crate::fs::{Buf, BufData, BufFlags, BufInner};
use crate::process::{pop_off, push_off};
use crate::spinlock::SpinLock;

use super::BlockDevice;

pub const IDE_CMD_READ: u8 = 0x20;
pub const IDE_CMD_WRITE: u8 = 0x30;
pub const IDE_CMD_RDMUL: u8 = 0xc4;
pub const IDE_CMD_WRMUL: u8 = 0xc5;

/// 一次块传输所需的 ATA 任务文件寄存器（0x1f2 ~ 0x1f7）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskFile {
    /// 0x1f2：扇区数
    pub count: u8,
    /// 0x1f3 ~ 0x1f5：LBA 低 24 位
    pub lba: [u8; 3],
    /// 0x1f6：LBA 模式、驱动器选择与 LBA 高 4 位
    pub drive_head: u8,
    /// 0x1f7：命令
    pub command: u8,
}

impl TaskFile {
    pub fn new(drive: u32, sector: u32, count: u8, command: u8) -> Self {
        let mut drive_head: u8 = 0xe0;
        drive_head.set_bit(4, drive.get_bit(0));
        drive_head.set_bits(0..4, sector.get_bits(24..28) as u8);
        Self {
            count,
            lba: [
                sector.get_bits(0..8) as u8,
                sector.get_bits(8..16) as u8,
                sector.get_bits(16..24) as u8,
            ],
            drive_head,
            command,
        }
    }

    pub fn drive(&self) -> u32 {
        self.drive_head.get_bit(4) as u32
    }

    pub fn sector(&self) -> u32 {
        let mut sector = 0u32;
        sector.set_bits(0..8, self.lba[0] as u32);
        sector.set_bits(8..16, self.lba[1] as u32);
        sector.set_bits(16..24, self.lba[2] as u32);
        sector.set_bits(24..28, self.drive_head.get_bits(0..4) as u32);
        sector
    }

    pub fn is_write(&self) -> bool {
        self.command == IDE_CMD_WRITE || self.command == IDE_CMD_WRMUL
    }
}

/// 挂在磁盘队列上的一次请求，存放于 [`Disk::rw`] 调用者的栈上
struct IoReq {
    dev: u32,
    blockno: u32,
    buf: *const BufInner,
    data: *mut BufData,
    qnext: *mut IoReq,
}

/// 磁盘请求队列，`head` 为正在传输的请求
struct DiskQueue {
    head: *mut IoReq,
    tail: *mut IoReq,
    /// 中断处理程序遇到致命错误后记录的消息，此后不再接受请求
    failed: Option<String>,
}

// 队列只在持有 `Disk::queue` 时访问；节点在出队之前其提交者不会返回
unsafe impl Send for DiskQueue {}

impl DiskQueue {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            failed: None,
        }
    }

    fn push(&mut self, req: *mut IoReq) {
        if self.tail.is_null() {
            self.head = req;
        } else {
            unsafe { (*self.tail).qnext = req; }
        }
        self.tail = req;
    }

    fn pop(&mut self) -> Option<*mut IoReq> {
        if self.head.is_null() {
            return None;
        }
        let req = self.head;
        self.head = unsafe { (*req).qnext };
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        Some(req)
    }

    /// 标记磁盘失效：摘下所有排队请求并唤醒其提交者，
    /// 提交者醒来后看到 `failed` 随即 panic。
    fn fail(&mut self, msg: String) {
        while let Some(req) = self.pop() {
            unsafe { (*(*req).buf).io.wakeup(); }
        }
        self.failed = Some(msg);
    }
}

pub struct Disk {
    queue: SpinLock<DiskQueue>,
    device: Arc<dyn BlockDevice>,
    havedisk1: AtomicBool,
}

impl Disk {
    pub fn new(device: Arc<dyn BlockDevice>) -> Arc<Self> {
        Arc::new(Self {
            queue: SpinLock::new(DiskQueue::new(), "ide"),
            device,
            havedisk1: AtomicBool::new(false),
        })
    }

    /// 注册磁盘中断并探测从盘。
    ///
    /// 中断处理函数只持有驱动的弱引用，驱动释放后到来的中断被忽略。
    pub fn init(self: &Arc<Self>) {
        let disk: Weak<Self> = Arc::downgrade(self);
        self.device.init(Box::new(move || match disk.upgrade() {
            Some(disk) => {
                push_off();
                disk.intr();
                pop_off();
            }
            None => log::warn!("ide: interrupt after driver teardown"),
        }));

        let havedisk1 = self.device.has_disk1();
        self.havedisk1.store(havedisk1, Ordering::Release);

        #[cfg(feature = "verbose_init_info")]
        println!("ide: disk 1 {}", if havedisk1 { "present" } else { "absent" });
    }

    pub fn has_disk1(&self) -> bool {
        self.havedisk1.load(Ordering::Acquire)
    }

    /// 同步读写一个缓冲块。
    ///
    /// 若缓冲块为脏则写回磁盘，否则若无效则从磁盘读入。
    /// 返回时缓冲块的标志恰好为 `VALID`。
    ///
    /// # 可能的错误
    /// - 调用者未持有缓冲块睡眠锁：`"iderw: buf not locked"`；
    /// - 缓冲块已有效且不脏：`"iderw: nothing to do"`；
    /// - 访问不存在的从盘：`"iderw: ide disk 1 not present"`；
    /// - 磁盘已因中断处理中的致命错误失效：以该错误消息 panic。
    pub fn rw(&self, buf: &mut Buf<'_>) {
        if !buf.holding() {
            panic!("iderw: buf not locked");
        }
        if buf.flags() & (BufFlags::VALID | BufFlags::DIRTY) == BufFlags::VALID {
            panic!("iderw: nothing to do");
        }
        match buf.dev() {
            0 => {}
            1 if self.has_disk1() => {}
            1 => panic!("iderw: ide disk 1 not present"),
            dev => panic!("iderw: no such disk {}", dev),
        }

        let inner = buf.inner();
        let mut req = IoReq {
            dev: buf.dev(),
            blockno: buf.blockno(),
            buf: inner,
            data: buf.raw_data_mut(),
            qnext: ptr::null_mut(),
        };
        let req_ptr: *mut IoReq = &mut req;

        #[cfg(feature = "trace_disk")]
        log::trace!(
            "iderw: {} dev {} block {}",
            if buf.dirty() { "write" } else { "read" },
            buf.dev(),
            buf.blockno()
        );

        let mut guard = self.queue.lock();
        if let Some(msg) = guard.failed.as_ref() {
            panic!("{}", msg);
        }
        guard.push(req_ptr);
        if guard.head == req_ptr {
            self.start(unsafe { &*req_ptr });
        }

        while inner.flags.load() & (BufFlags::VALID | BufFlags::DIRTY) != BufFlags::VALID {
            // 失效时请求已被摘出队列，可以安全地展开栈
            if let Some(msg) = guard.failed.as_ref() {
                panic!("{}", msg);
            }
            inner.io.sleep(guard);
            guard = self.queue.lock();
        }
        drop(guard);
    }

    /// 为队首请求下发命令，调用者持有队列锁。
    fn start(&self, req: &IoReq) {
        if req.blockno as usize >= FSSIZE {
            panic!("incorrect blockno");
        }
        let sector_per_block = BSIZE / SECTOR_SIZE;
        if sector_per_block > 7 {
            panic!("idestart");
        }
        let sector = req.blockno * sector_per_block as u32;
        let (read_cmd, write_cmd) = if sector_per_block == 1 {
            (IDE_CMD_READ, IDE_CMD_WRITE)
        } else {
            (IDE_CMD_RDMUL, IDE_CMD_WRMUL)
        };

        let buf = unsafe { &*req.buf };
        if buf.flags.load().contains(BufFlags::DIRTY) {
            let cmd = TaskFile::new(req.dev, sector, sector_per_block as u8, write_cmd);
            self.device.issue(cmd, Some(unsafe { &*req.data }));
        } else {
            let cmd = TaskFile::new(req.dev, sector, sector_per_block as u8, read_cmd);
            self.device.issue(cmd, None);
        }
    }

    /// 磁盘中断处理函数。
    ///
    /// 摘下队首请求，读请求从控制器取回数据；
    /// 然后把缓冲块标记为 `VALID` 并清除 `DIRTY`，唤醒等待者，启动下一个请求。
    ///
    /// # 可能的错误
    /// - 队列为空时收到中断；
    /// - 控制器报告错误。
    ///
    /// 两者都使磁盘失效：所有等待中的提交者被唤醒并以同一消息 panic，
    /// 之后的 [`rw`](Self::rw) 也立即 panic。中断处理程序可能运行在控制器线程上，
    /// 只在该线程 panic 会让提交者永远睡眠。
    pub fn intr(&self) {
        let mut guard = self.queue.lock();

        let req = match guard.pop() {
            Some(req) => unsafe { &*req },
            None => {
                let msg = String::from("ideintr: interrupt with empty queue");
                guard.fail(msg.clone());
                panic!("{}", msg);
            }
        };
        let buf = unsafe { &*req.buf };

        let reading = !buf.flags.load().contains(BufFlags::DIRTY);
        let data = if reading { Some(unsafe { &mut *req.data }) } else { None };
        if let Err(e) = self.device.finish(data) {
            let msg = format!("ideintr: {} on dev {} block {}", e, req.dev, req.blockno);
            log::error!("{}", msg);
            buf.io.wakeup();
            guard.fail(msg.clone());
            panic!("{}", msg);
        }

        #[cfg(feature = "trace_disk")]
        log::trace!(
            "ideintr: {} done dev {} block {}",
            if reading { "read" } else { "write" },
            req.dev,
            req.blockno
        );

        // 提交者要重新获取队列锁才能看到新标志并返回，
        // 在此之前 `req` 一直有效
        buf.flags.insert(BufFlags::VALID);
        buf.flags.remove(BufFlags::DIRTY);
        buf.io.wakeup();

        if !guard.head.is_null() {
            self.start(unsafe { &*guard.head });
        }
        drop(guard);
    }

    /// 从队首到队尾列出排队中的 `(dev, blockno)`，用于诊断
    pub fn queued(&self) -> Vec<(u32, u32)> {
        let guard = self.queue.lock();
        let mut v = Vec::new();
        let mut req = guard.head;
        while !req.is_null() {
            let r = unsafe { &*req };
            v.push((r.dev, r.blockno));
            req = r.qnext;
        }
        v
    }
}
