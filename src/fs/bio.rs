//! 缓存层
//!
//! 缓冲区缓存是一组固定数量的缓冲块，保存磁盘块内容的内存副本。
//! 在内存中缓存磁盘块可以减少磁盘读取，
//! 同时也为多个进程共同使用的磁盘块提供了一个同步点。
//!
//! 接口：
//! - 获取某个磁盘块的缓冲块，调用 [`Bcache::bread`]；
//! - 修改缓冲块数据后，调用 [`Buf::bwrite`] 写回磁盘；
//! - 使用完毕后调用 [`Buf::brelse`]（或直接丢弃 [`Buf`]）；
//! - 同一时刻只有一个进程可以使用某个缓冲块，因此不要长时间持有。
//!
//! 缓冲块内部使用两个状态标志：
//! - `VALID`：缓冲块数据已从磁盘读入（或已写入磁盘）；
//! - `DIRTY`：缓冲块数据已被修改，需要写回磁盘。

use array_macro::array;

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::consts::fs::{BSIZE, FSSIZE, NBUF};
use crate::driver::Disk;
use crate::process::WaitChannel;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;

/// 缓冲区缓存（Buffer Cache），用于块设备的读写缓存。
///
/// `Bcache` 提供了一个固定大小的内存缓冲区池，用于缓存磁盘块数据，
/// 以减少重复的磁盘访问。它结合 LRU（最近最少使用）替换策略
/// 维护块缓冲的使用顺序，并通过自旋锁与睡眠锁机制实现线程安全的数据访问。
///
/// 该结构在内核初始化阶段构造一次，以引用的形式交给所有使用者，
/// 是文件系统与块设备驱动之间的关键缓冲层。
pub struct Bcache {
    /// 控制 LRU 缓存元信息的自旋锁。
    ///
    /// 该字段保护 `BufLru`，后者维护所有缓冲块的 LRU 链表结构、
    /// 引用计数、块号与设备号等元数据。整个缓存共用这一把锁。
    ctrl: SpinLock<BufLru>,

    /// 缓冲块数组，长度为固定值 `NBUF`，与 `BufLru::inner` 按下标一一对应。
    ///
    /// 每个缓冲块包含块数据和一个睡眠锁（`SleepLock`），
    /// 数据由睡眠锁保护，与 `ctrl` 互相独立。
    bufs: [BufInner; NBUF],

    /// 缓冲块未命中时用于读写磁盘的驱动
    disk: Arc<Disk>,
}

impl Bcache {
    /// 创建缓冲区缓存，并把全部缓冲块串成 LRU 链表。
    pub fn new(disk: Arc<Disk>) -> Self {
        Self {
            ctrl: SpinLock::new(BufLru::new(), "bcache"),
            bufs: array![_ => BufInner::new(); NBUF],
            disk,
        }
    }

    /// 缓冲块数量
    pub const fn capacity(&self) -> usize {
        NBUF
    }

    /// 获取指定设备与块号对应的缓冲块，返回时已持有其睡眠锁。
    ///
    /// # 功能说明
    /// `bget` 查找是否已缓存给定的 `(dev, blockno)` 对应的块。
    /// 若缓存命中，则返回已存在的缓冲块；否则回收一个未被引用且不脏的块。
    /// 该函数不涉及实际磁盘读写，调用者需通过 `valid` 判断是否需要从磁盘加载数据。
    ///
    /// # 流程解释
    /// - 锁住 `BufLru` 控制结构；
    /// - 从最近使用端开始调用 `find_cached` 查找：
    ///   - 命中：引用计数加一，释放控制锁后获取缓冲块的睡眠锁（可能阻塞）；
    ///   - 未命中：从最久未使用端调用 `recycle` 回收一个引用计数为 0 且不脏的块，
    ///     清除其标志位，释放控制锁后获取睡眠锁（刚刚认领，不会竞争）。
    ///
    /// # 可能的错误
    /// - 块号超出设备容量时触发 panic；
    /// - 所有缓冲块都被引用或都是脏块时，无法执行替换，触发 panic（`"bget: no buffers"`）。
    pub fn bget(&self, dev: u32, blockno: u32) -> Buf<'_> {
        if blockno as usize >= FSSIZE {
            panic!("bget: blockno {} out of range", blockno);
        }

        let mut ctrl = self.ctrl.lock();

        let index = match ctrl.find_cached(dev, blockno) {
            Some(index) => index,
            None => {
                let bufs = &self.bufs;
                match ctrl.recycle(dev, blockno, |i| !bufs[i].flags.load().contains(BufFlags::DIRTY)) {
                    Some(index) => {
                        self.bufs[index].flags.store(BufFlags::empty());
                        index
                    }
                    None => panic!("bget: no buffers"),
                }
            }
        };
        drop(ctrl);

        Buf {
            cache: self,
            index,
            dev,
            blockno,
            data: Some(self.bufs[index].data.lock()),
        }
    }

    /// 返回一个已上锁、内容与磁盘一致的缓冲块。
    ///
    /// 若缓冲块尚未有效，则通过磁盘驱动同步读取，返回时 `valid` 一定为真。
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut b = self.bget(dev, blockno);
        if !b.valid() {
            self.disk.rw(&mut b);
        }
        b
    }

    /// 缓冲块的睡眠锁已释放，在控制锁下减少引用计数；
    /// 引用计数归零时移到 LRU 链表的最近使用端。
    fn brelse(&self, index: usize) {
        self.ctrl.lock().move_if_no_ref(index);
    }

    /// 从最近使用端到最久未使用端列出所有已分配给磁盘块的缓冲块，用于诊断。
    pub fn lru_order(&self) -> Vec<BufInfo> {
        let ctrl = self.ctrl.lock();
        let mut v = Vec::with_capacity(NBUF);
        let mut b = ctrl.head;
        while let Some(i) = b {
            let c = &ctrl.inner[i];
            if let Some((dev, blockno)) = c.key {
                v.push(BufInfo {
                    index: i,
                    dev,
                    blockno,
                    refcnt: c.refcnt,
                    flags: self.bufs[i].flags.load(),
                });
            }
            b = c.next;
        }
        v
    }
}

/// [`Bcache::lru_order`] 返回的缓冲块快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufInfo {
    pub index: usize,
    pub dev: u32,
    pub blockno: u32,
    pub refcnt: usize,
    pub flags: BufFlags,
}

/// 已上锁的缓冲块。
///
/// `Buf` 代表一个特定 `(dev, blockno)` 的缓冲块，
/// 持有对其数据的独占访问权限（由 `SleepLockGuard` 保护），
/// 并在生命周期结束时释放睡眠锁、更新 LRU 状态。
pub struct Buf<'a> {
    cache: &'a Bcache,

    /// 缓冲块在缓存数组中的下标
    index: usize,

    dev: u32,
    blockno: u32,

    /// 在 `Buf` 生命周期内保证始终为 `Some`，
    /// 释放时先取出守卫释放睡眠锁，再更新引用计数。
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a> Buf<'a> {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    /// 缓冲块在缓存中的槽位，同一槽位意味着同一个缓存项。
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn flags(&self) -> BufFlags {
        self.inner().flags.load()
    }

    pub fn valid(&self) -> bool {
        self.flags().contains(BufFlags::VALID)
    }

    pub fn dirty(&self) -> bool {
        self.flags().contains(BufFlags::DIRTY)
    }

    /// 当前进程是否仍持有该缓冲块的睡眠锁。
    pub fn holding(&self) -> bool {
        self.data.as_ref().map_or(false, |guard| guard.holding())
    }

    pub fn data(&self) -> &BufData {
        match self.data.as_ref() {
            Some(guard) => &**guard,
            None => panic!("buf: data after release"),
        }
    }

    pub fn data_mut(&mut self) -> &mut BufData {
        match self.data.as_mut() {
            Some(guard) => &mut **guard,
            None => panic!("buf: data after release"),
        }
    }

    /// 提供指向缓冲区数据的原始可变指针，供磁盘驱动在传输期间使用。
    pub(crate) fn raw_data_mut(&mut self) -> *mut BufData {
        self.data_mut()
    }

    pub(crate) fn inner(&self) -> &'a BufInner {
        &self.cache.bufs[self.index]
    }

    /// 将缓冲块内容写回磁盘，返回时数据已写入且 `dirty` 被清除。
    ///
    /// 调用者必须持有该缓冲块的睡眠锁。
    pub fn bwrite(&mut self) {
        if !self.holding() {
            panic!("bwrite");
        }
        self.inner().flags.insert(BufFlags::DIRTY);
        self.cache.disk.rw(self);
    }

    /// 只标记为脏而不立即写盘。
    ///
    /// 供上层日志使用：脏块即使引用计数为 0 也不会被回收，
    /// 直到之后某次 `bwrite` 完成。
    pub fn set_dirty(&mut self) {
        if !self.holding() {
            panic!("set_dirty");
        }
        self.inner().flags.insert(BufFlags::DIRTY);
    }

    /// 将当前缓冲块的引用计数加一，“钉住”该块，防止其在释放后被回收。
    pub fn pin(&self) {
        self.cache.ctrl.lock().inner[self.index].refcnt += 1;
    }

    /// 撤销一次 `pin`。必须与 `pin` 配对调用。
    pub fn unpin(&self) {
        let mut ctrl = self.cache.ctrl.lock();
        let rc = &mut ctrl.inner[self.index].refcnt;
        if *rc <= 1 {
            panic!("buf unpin not match");
        }
        *rc -= 1;
    }

    /// 释放缓冲块。等价于丢弃 `Buf`。
    pub fn brelse(self) {
        drop(self);
    }
}

impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        if let Some(guard) = self.data.take() {
            if !guard.holding() {
                panic!("brelse");
            }
            drop(guard);
            self.cache.brelse(self.index);
        }
    }
}

/// 缓冲区缓存的 LRU 链表控制结构。
///
/// 链表节点存放在定长数组 `inner` 中，前后指针用数组下标表示。
/// `head` 为最近使用端，`tail` 为最久未使用端。
struct BufLru {
    inner: [BufCtrl; NBUF],
    head: Option<usize>,
    tail: Option<usize>,
}

impl BufLru {
    fn new() -> Self {
        let mut lru = Self {
            inner: array![_ => BufCtrl::new(); NBUF],
            head: None,
            tail: None,
        };
        for i in 0..NBUF {
            lru.inner[i].prev = i.checked_sub(1);
            lru.inner[i].next = if i + 1 < NBUF { Some(i + 1) } else { None };
        }
        lru.head = Some(0);
        lru.tail = Some(NBUF - 1);
        lru
    }

    /// 从最近使用端开始查找 `(dev, blockno)`，命中时引用计数加一并返回下标。
    fn find_cached(&mut self, dev: u32, blockno: u32) -> Option<usize> {
        let mut b = self.head;
        while let Some(i) = b {
            let bref = &mut self.inner[i];
            if bref.key == Some((dev, blockno)) {
                bref.refcnt += 1;
                return Some(i);
            }
            b = bref.next;
        }
        None
    }

    /// 从最久未使用端开始查找引用计数为 0 且 `clean(下标)` 为真的缓冲块，
    /// 将其认领给 `(dev, blockno)`，引用计数置 1。
    fn recycle(&mut self, dev: u32, blockno: u32, clean: impl Fn(usize) -> bool) -> Option<usize> {
        #[cfg(feature = "kernel_warning")]
        let mut skipped = 0;

        let mut b = self.tail;
        while let Some(i) = b {
            let bref = &mut self.inner[i];
            if bref.refcnt == 0 {
                if clean(i) {
                    bref.key = Some((dev, blockno));
                    bref.refcnt = 1;

                    #[cfg(feature = "kernel_warning")]
                    {
                        if skipped > 0 {
                            log::warn!("bget: passed over {} dirty unreferenced buffers", skipped);
                        }
                    }
                    return Some(i);
                }
                #[cfg(feature = "kernel_warning")]
                {
                    skipped += 1;
                }
            }
            b = bref.prev;
        }
        None
    }

    /// 引用计数减一；归零时把该块移到最近使用端。
    fn move_if_no_ref(&mut self, index: usize) {
        let b = &mut self.inner[index];
        b.refcnt = match b.refcnt.checked_sub(1) {
            Some(rc) => rc,
            None => panic!("brelse: refcnt underflow"),
        };
        if b.refcnt == 0 && self.head != Some(index) {
            self.unlink(index);
            self.push_front(index);
        }
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = (self.inner[index].prev, self.inner[index].next);
        match prev {
            Some(p) => self.inner[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.inner[n].prev = prev,
            None => self.tail = prev,
        }
        self.inner[index].prev = None;
        self.inner[index].next = None;
    }

    fn push_front(&mut self, index: usize) {
        self.inner[index].prev = None;
        self.inner[index].next = self.head;
        match self.head {
            Some(h) => self.inner[h].prev = Some(index),
            None => self.tail = Some(index),
        }
        self.head = Some(index);
    }
}

/// 缓冲块控制结构，记录缓冲块的元信息并构成 LRU 链表。
struct BufCtrl {
    /// 缓存的 `(dev, blockno)`，从未分配过的缓冲块为 `None`
    key: Option<(u32, u32)>,
    prev: Option<usize>,
    next: Option<usize>,

    /// 为 0 时表示未被使用，可被 `recycle` 回收。
    refcnt: usize,
}

impl BufCtrl {
    const fn new() -> Self {
        Self {
            key: None,
            prev: None,
            next: None,
            refcnt: 0,
        }
    }
}

/// 缓冲块的数据部分，与 `BufCtrl` 按下标配对。
///
/// 数据由 `SleepLock` 保护；标志位只由睡眠锁持有者修改，
/// 磁盘中断处理程序在持有者睡眠等待期间代其修改。
pub(crate) struct BufInner {
    pub(crate) flags: AtomicBufFlags,

    /// 磁盘完成该缓冲块的传输时在此通道上唤醒等待者
    pub(crate) io: WaitChannel,

    data: SleepLock<BufData>,
}

impl BufInner {
    const fn new() -> Self {
        Self {
            flags: AtomicBufFlags::new(),
            io: WaitChannel::new("buf io"),
            data: SleepLock::new(BufData::new(), "buffer"),
        }
    }
}

bitflags! {
    /// 缓冲块状态标志
    pub struct BufFlags: u8 {
        /// 数据已从磁盘读入
        const VALID = 0x2;
        /// 数据需要写回磁盘
        const DIRTY = 0x4;
    }
}

/// 以原子字节保存的 [`BufFlags`]
pub(crate) struct AtomicBufFlags(AtomicU8);

impl AtomicBufFlags {
    const fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    pub(crate) fn load(&self) -> BufFlags {
        BufFlags::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, flags: BufFlags) {
        self.0.store(flags.bits(), Ordering::Release);
    }

    pub(crate) fn insert(&self, flags: BufFlags) {
        self.0.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn remove(&self, flags: BufFlags) {
        self.0.fetch_and(!flags.bits(), Ordering::AcqRel);
    }
}

/// BufData 的对齐方式应足以满足可能由此结构体转换而来的其他结构体的需求。
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    pub const fn new() -> Self {
        Self([0; BSIZE])
    }
}

impl Default for BufData {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
