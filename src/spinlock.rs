//! 自旋锁模块
//! 自旋锁将数据包裹在自身内部以保护这些数据。

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut, Drop};
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};

use crate::process::{CpuManager, pop_off, push_off};

/// 表示一个自旋锁结构，用于在多核环境下保护共享数据。
///
/// `SpinLock` 提供了互斥访问内部数据的能力，通过忙等待（busy-waiting）实现锁机制。
/// 当锁被占用时，尝试获取锁的核心将在循环中等待，直到锁被释放。
/// 持锁期间本核心的中断被关闭（见 [`push_off`]），因此中断处理程序可以与普通代码
/// 使用同一把锁而不会与自身死锁。
/// 该锁还跟踪持有锁的核心编号，用于调试和死锁检测。
///
/// # 类型参数
/// - `T`: 被保护的数据类型，可以是任意大小（`?Sized`）。
///
/// # 字段说明
/// - `lock`: 原子布尔值，表示锁的状态（`false`=未锁定，`true`=已锁定）；
/// - `name`: 锁的名称，用于调试和标识；
/// - `cpuid`: 当前持有锁的核心编号（0 表示无核心持有）；
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性。
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    cpuid: AtomicUsize,
    data: UnsafeCell<T>,
}

// 为SpinLock实现Sync trait，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建一个新的自旋锁实例。
    ///
    /// # 参数
    /// - `data`: 需要被保护的数据；
    /// - `name`: 锁的标识名称，用于调试。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            cpuid: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取自旋锁并返回一个守卫对象。
    ///
    /// # 功能说明
    /// 通过忙等待获取锁的所有权，返回一个守卫对象。
    /// 守卫对象实现了`Deref`和`DerefMut`，允许直接访问被保护数据。
    /// 当守卫对象离开作用域时，自动释放锁。
    ///
    /// # 示例
    /// ```
    /// use xv6_bio::spinlock::SpinLock;
    ///
    /// let lock = SpinLock::new(0, "test");
    /// {
    ///     let mut guard = lock.lock(); // 获取锁
    ///     *guard = 42; // 修改受保护数据
    /// } // 守卫离开作用域，自动释放锁
    /// assert_eq!(*lock.lock(), 42);
    /// ```
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
            _not_send: PhantomData,
        }
    }

    /// 锁的名称。
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 检查当前核心是否持有此锁。
    ///
    /// 读取期间关闭中断，避免检查过程中被中断处理程序打断。
    pub fn holding(&self) -> bool {
        push_off();
        let r = self.holding_locked();
        pop_off();
        r
    }

    /// 前提条件：中断已被关闭（由`push_off`保证）。
    fn holding_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
            && self.cpuid.load(Ordering::Relaxed) == CpuManager::cpu_id()
    }

    /// 获取锁的核心实现（内部方法）。
    ///
    /// # 流程解释
    /// 1. 调用`push_off()`禁用中断；
    /// 2. 检查是否已持有锁（不可重入，重入视为致命错误）；
    /// 3. 使用原子比较交换（CAS）忙等待获取锁；
    /// 4. 获取成功后设置内存屏障；
    /// 5. 记录当前核心编号。
    fn acquire(&self) {
        push_off();
        if self.holding_locked() {
            panic!("spinlock {} acquire", self.name);
        }
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        fence(Ordering::SeqCst);
        self.cpuid.store(CpuManager::cpu_id(), Ordering::Relaxed);
    }

    /// 释放锁的核心实现（内部方法）。
    ///
    /// # 流程解释
    /// 1. 验证当前核心确实持有锁；
    /// 2. 清除核心编号记录；
    /// 3. 设置内存屏障，保证临界区内的写入先于“锁已释放”被其他核心看到；
    /// 4. 原子存储`false`释放锁；
    /// 5. 调用`pop_off()`恢复中断状态。
    fn release(&self) {
        if !self.holding_locked() {
            panic!("spinlock {} release", self.name);
        }
        self.cpuid.store(0, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.lock.store(false, Ordering::Release);
        pop_off();
    }

    /// 手动释放锁的特殊接口。
    ///
    /// # 安全性
    /// - 调用者必须确保当前核心确实持有该锁，且对应的守卫已被 `mem::forget`；
    /// - 释放后不得再访问受保护数据。
    pub unsafe fn unlock(&self) {
        self.release();
    }
}

/// 自旋锁守卫对象，提供对受保护数据的访问。
///
/// 当守卫对象存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁。
///
/// 锁由获取它的核心释放，守卫不能被移交给其他线程：
/// ```compile_fail
/// use xv6_bio::spinlock::SpinLock;
///
/// static LOCK: SpinLock<i32> = SpinLock::new(0, "send");
/// let guard = LOCK.lock();
/// std::thread::spawn(move || drop(guard));
/// ```
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
    /// 关中断与持锁核心编号都属于当前线程
    _not_send: PhantomData<*const ()>,
}

unsafe impl<'a, T: ?Sized + Sync> Sync for SpinLockGuard<'a, T> {}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    /// 当守卫离开作用域时自动释放锁，并恢复中断状态（通过`pop_off`）
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    /// 检查当前核心是否持有此守卫对应的锁。
    ///
    /// 守卫存在时通常应持有锁，此方法用于调试验证。
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}
