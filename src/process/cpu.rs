//! 处理器状态管理，用于控制中断开关与关中断的嵌套计数
//!
//! 宿主环境中没有真实的处理器核心与中断控制器：每个线程被视为一个独立的核心，
//! 其中断使能位与 `push_off`/`pop_off` 嵌套计数保存在线程局部的 [`Cpu`] 中。
//! 自旋锁依赖这里的记账来保证“持锁期间本核心不响应中断”，
//! 睡眠原语依赖嵌套计数来检查“阻塞前只持有一把自旋锁”。

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

thread_local! {
    static CPU: Cpu = const { Cpu::new() };
}

/// 下一个分配给新线程的核心编号，0 保留表示“无持有者”。
static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

/// CPU 管理器，提供访问当前核心状态的入口。
///
/// 与内核中按 `tp` 寄存器索引全局 `Cpu` 表不同，
/// 宿主环境下当前核心的状态就是当前线程的线程局部变量，
/// 因此不需要全局表，也不需要 `unsafe`。
pub struct CpuManager;

impl CpuManager {
    /// 返回当前核心的编号（从 1 开始，首次调用时分配）。
    #[inline]
    pub fn cpu_id() -> usize {
        CPU.with(|c| c.id())
    }

    /// 当前核心关中断的嵌套层数，即当前持有的自旋锁数量。
    #[inline]
    pub fn noff() -> u8 {
        CPU.with(|c| c.noff.get())
    }
}

/// 单个核心的状态信息。
///
/// 只由所属线程访问，因此使用 `Cell` 即可。
pub struct Cpu {
    /// 核心编号，0 表示尚未分配
    id: Cell<usize>,

    /// 关闭中断的嵌套计数。
    /// 每调用一次 `push_off` 计数加 1，每调用一次 `pop_off` 计数减 1。
    noff: Cell<u8>,

    /// 记录最外层 `push_off` 之前的中断使能状态，用于恢复中断使能。
    intena: Cell<bool>,

    /// 模拟的中断使能位，线程创建时中断处于开启状态。
    intr: Cell<bool>,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            id: Cell::new(0),
            noff: Cell::new(0),
            intena: Cell::new(false),
            intr: Cell::new(true),
        }
    }

    fn id(&self) -> usize {
        let id = self.id.get();
        if id != 0 {
            return id;
        }
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        self.id.set(id);
        id
    }
}

/// 当前核心是否允许中断。
#[inline]
pub fn intr_get() -> bool {
    CPU.with(|c| c.intr.get())
}

/// 打开当前核心的中断。
#[inline]
pub fn intr_on() {
    CPU.with(|c| c.intr.set(true));
}

/// 关闭当前核心的中断。
#[inline]
pub fn intr_off() {
    CPU.with(|c| c.intr.set(false));
}

/// # 功能说明
/// 关闭当前核心的中断，并增加嵌套计数。
/// 与 `intr_off` 不同，`push_off`/`pop_off` 成对使用：
/// 两次 `push_off` 需要两次 `pop_off` 才能撤销；
/// 若进入前中断是关闭的，则最终的 `pop_off` 也不会打开中断。
///
/// # 流程解释
/// 1. 读取当前中断使能状态；
/// 2. 关闭中断；
/// 3. 若嵌套计数为 0，记录原始中断状态到 `intena`；
/// 4. 嵌套计数加 1。
pub fn push_off() {
    let old = intr_get();
    intr_off();
    CPU.with(|c| {
        if c.noff.get() == 0 {
            c.intena.set(old);
        }
        c.noff.set(c.noff.get() + 1);
    });
}

/// # 功能说明
/// 撤销一次 `push_off`，在最外层撤销时恢复进入前的中断状态。
///
/// # 可能的错误
/// - 若此时中断处于开启状态，说明临界区内有人错误地打开了中断，触发 panic；
/// - 若嵌套计数已经为 0，说明 `push_off`/`pop_off` 不匹配，触发 panic。
pub fn pop_off() {
    if intr_get() {
        panic!("pop_off(): interruptable");
    }
    CPU.with(|c| {
        let noff = match c.noff.get().checked_sub(1) {
            Some(noff) => noff,
            None => panic!("pop_off(): count not match"),
        };
        c.noff.set(noff);
        if noff == 0 && c.intena.get() {
            intr_on();
        }
    });
}
