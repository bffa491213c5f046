//! 进程调度协作模块
//!
//! 缓冲区缓存与磁盘驱动只需要调度器提供以下原语：
//! - 当前执行流的标识（[`my_pid`]）；
//! - 在某个等待通道上释放自旋锁并睡眠（[`WaitChannel::sleep`]）；
//! - 唤醒某个等待通道上的全部睡眠者（[`WaitChannel::wakeup`]）。
//!
//! 宿主环境中每个线程既是一个“进程”也是一个“核心”，
//! 睡眠与唤醒由标准库的互斥量与条件变量完成。

use std::sync::{Condvar, Mutex, PoisonError};

use crate::spinlock::SpinLockGuard;

pub use cpu::CpuManager;
pub use cpu::{intr_get, intr_off, intr_on, pop_off, push_off};

mod cpu;

/// 返回当前执行流（线程）的标识，用于记录睡眠锁的持有者。
#[inline]
pub fn my_pid() -> usize {
    CpuManager::cpu_id()
}

/// 等待通道。
///
/// 内核中睡眠通道只是一个地址，互不相关的等待者可能共享同一个地址；
/// 这里每一种等待原因拥有各自独立的通道对象（每把睡眠锁一个，每个缓冲块的
/// 磁盘完成事件一个），唤醒不会波及无关的等待者。
///
/// 通道内部维护一个唤醒序号：睡眠者在释放自旋锁之前记下序号，
/// 唤醒者在持有同一把自旋锁时递增序号，因此“检查条件”与“进入睡眠”之间
/// 发生的唤醒不会丢失。
pub struct WaitChannel {
    name: &'static str,
    seq: Mutex<u64>,
    cond: Condvar,
}

impl WaitChannel {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            seq: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// # 功能说明
    /// 原子地释放 `guard` 对应的自旋锁并在本通道上睡眠，直到被 [`wakeup`](Self::wakeup)。
    /// 返回时自旋锁处于释放状态，调用者需要重新获取锁并再次检查等待条件：
    /// 唤醒是对整个通道的广播，对某个具体的等待者而言可能是虚假的。
    ///
    /// # 可能的错误
    /// - 若当前核心除了 `guard` 之外还持有其他自旋锁，触发 panic：
    ///   持有自旋锁睡眠会使其他核心永远自旋。
    pub fn sleep<T: ?Sized>(&self, guard: SpinLockGuard<'_, T>) {
        if CpuManager::noff() != 1 {
            panic!("sleep(): cpu hold multi locks");
        }

        // 必须先持有通道的互斥量再释放自旋锁，
        // 唤醒者持有同一把自旋锁才会递增序号，因此不会错过任何唤醒。
        let mut seq = self.seq.lock().unwrap_or_else(PoisonError::into_inner);
        let start = *seq;
        drop(guard);

        while *seq == start {
            seq = self.cond.wait(seq).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// 唤醒所有在本通道上睡眠的执行流。
    ///
    /// 调用者应持有睡眠者传给 [`sleep`](Self::sleep) 的那把自旋锁。
    pub fn wakeup(&self) {
        let mut seq = self.seq.lock().unwrap_or_else(PoisonError::into_inner);
        *seq = seq.wrapping_add(1);
        drop(seq);
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spinlock::SpinLock;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn sleep_returns_after_wakeup_under_the_same_lock() {
        let state = Arc::new((SpinLock::new(false, "flag"), WaitChannel::new("flag")));
        let waker = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                let (lock, chan) = &*state;
                let mut guard = lock.lock();
                *guard = true;
                chan.wakeup();
                drop(guard);
            })
        };

        let (lock, chan) = &*state;
        let mut guard = lock.lock();
        while !*guard {
            chan.sleep(guard);
            guard = lock.lock();
        }
        drop(guard);
        waker.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "sleep(): cpu hold multi locks")]
    fn sleeping_with_two_spinlocks_is_fatal() {
        let outer = SpinLock::new((), "outer");
        let inner = SpinLock::new((), "inner");
        let chan = WaitChannel::new("never");
        let _outer = outer.lock();
        chan.sleep(inner.lock());
    }

    #[test]
    fn my_pid_is_stable_within_a_thread() {
        assert_eq!(my_pid(), my_pid());
        assert_ne!(my_pid(), thread::spawn(my_pid).join().unwrap());
    }
}
