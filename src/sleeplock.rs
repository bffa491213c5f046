//! 睡眠锁模块
//! 提供基于进程休眠/唤醒机制的同步原语，适用于可能长时间持有的锁。
//!
//! 当锁被占用时，尝试获取锁的进程会进入休眠状态，避免忙等待。
//! 持有睡眠锁期间可以等待磁盘 I/O，而自旋锁绝不能这样做。

use std::cell::{Cell, UnsafeCell};
use std::ops::{Deref, DerefMut, Drop};

use crate::process::{my_pid, WaitChannel};
use crate::spinlock::SpinLock;

/// 睡眠锁结构，提供阻塞式同步机制
///
/// 与自旋锁不同，当锁被占用时，尝试获取的进程会进入休眠状态，
/// 直到锁被释放后被唤醒。这避免了忙等待，适用于可能长时间持有的锁。
///
/// # 字段说明
/// - `lock`: 内部自旋锁，保护`locked`与`pid`
/// - `locked`: 表示锁是否已被占用
/// - `pid`: 持有锁的进程标识（0 表示无持有者）
/// - `chan`: 本锁专用的等待通道
/// - `name`: 锁的标识名称，用于调试
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<()>,
    locked: Cell<bool>,
    pid: Cell<usize>,
    chan: WaitChannel,
    name: &'static str,
    data: UnsafeCell<T>,
}

// `locked` 与 `pid` 只在持有内部自旋锁时访问
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// 创建一个新的睡眠锁实例
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new((), "sleeplock"),
            locked: Cell::new(false),
            pid: Cell::new(0),
            chan: WaitChannel::new("sleeplock"),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能阻塞进程）
    ///
    /// # 流程解释
    /// 1. 获取内部自旋锁保护临界区
    /// 2. 检查`locked`状态：
    ///   - 如果已被当前进程持有：致命错误（睡眠锁不可重入）
    ///   - 如果已被其他进程持有：在本锁的等待通道上休眠，醒来后重新获取内部锁并再次检查
    ///   - 如果未锁定：设置`locked=true`、记录持有者
    /// 3. 释放内部自旋锁
    ///
    /// # 返回值
    /// `SleepLockGuard<T>`守卫对象，提供对内部数据的访问
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut guard = self.lock.lock();

        while self.locked.get() {
            if self.pid.get() == my_pid() {
                panic!("sleeplock {} acquire", self.name);
            }
            self.chan.sleep(guard);
            guard = self.lock.lock();
        }

        self.locked.set(true);
        self.pid.set(my_pid());
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 当前进程是否持有该睡眠锁
    pub fn holding(&self) -> bool {
        let guard = self.lock.lock();
        let r = self.locked.get() && self.pid.get() == my_pid();
        drop(guard);
        r
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 释放锁（内部方法，由守卫的Drop调用）
    ///
    /// 清除持有状态后唤醒所有在本锁上等待的进程。
    fn unlock(&self) {
        let guard = self.lock.lock();
        self.locked.set(false);
        self.pid.set(0);
        self.chan.wakeup();
        drop(guard);
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问
///
/// 当守卫存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> SleepLockGuard<'a, T> {
    /// 守卫是否仍由当前进程持有。
    /// 守卫被移交给其他线程后返回 `false`。
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn holding_only_for_the_owner() {
        let lock = Arc::new(SleepLock::new(0u32, "owner"));
        let guard = lock.lock();
        assert!(lock.holding());
        assert!(guard.holding());
        let other = Arc::clone(&lock);
        assert!(!thread::spawn(move || other.holding()).join().unwrap());
        drop(guard);
        assert!(!lock.holding());
    }

    #[test]
    fn waiter_blocks_until_release() {
        let lock = Arc::new(SleepLock::new(Vec::new(), "order"));
        let mut guard = lock.lock();
        guard.push(1);

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.lock().push(2))
        };
        thread::sleep(Duration::from_millis(20));
        guard.push(3);
        drop(guard);
        waiter.join().unwrap();

        assert_eq!(*lock.lock(), vec![1, 3, 2]);
    }

    #[test]
    fn mutual_exclusion_across_threads() {
        let lock = Arc::new(SleepLock::new((), "mutex"));
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _g = lock.lock();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    #[should_panic(expected = "sleeplock twice acquire")]
    fn reacquire_by_holder_is_fatal() {
        let lock = SleepLock::new((), "twice");
        let _g = lock.lock();
        let _g2 = lock.lock();
    }
}
