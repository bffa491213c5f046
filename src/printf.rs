//! 定义内核的输出方法
//!
//! `print!`/`println!` 直接写到宿主的标准错误输出，
//! 同时提供一个 `log` 门面的实现，把驱动与缓存的诊断信息按同样的方式输出。

use std::fmt;
use std::io::{self, Write as _};

use log::{LevelFilter, Log, Metadata, Record};

use crate::spinlock::SpinLock;

/// 零大小类型（ZST）的打印结构体，用于在多个核心之间对打印操作进行排序。
struct Print;

impl fmt::Write for Print {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        io::stderr().write_all(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

/// 核心打印函数（被宏调用）
///
/// 使用自旋锁保证多核输出时一次调用的内容不会被其他核心打断。
/// 宿主输出失败时丢弃该次输出。
#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    use fmt::Write;
    static PRINT: SpinLock<()> = SpinLock::new((), "print");

    let guard = PRINT.lock();
    let _ = Print.write_fmt(args);
    drop(guard);
}

/// 在终端输出一串字符
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::printf::_print(format_args!($($arg)*));
    };
}

/// 在终端输出一行字符
#[macro_export]
macro_rules! println {
    () => {$crate::print!("\n")};
    ($fmt:expr) => {$crate::print!(concat!($fmt, "\n"))};
    ($fmt:expr, $($arg:tt)*) => {
        $crate::print!(concat!($fmt, "\n"), $($arg)*)
    };
}

/// 把 `log` 记录经由 [`_print`] 输出的日志器
struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            println!("[{:>5}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// 安装内核日志器并设置最大日志级别。
///
/// 可以重复调用：已经安装过日志器时只调整级别。
pub fn init_logger(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_err() {
        log::debug!("logger already installed");
    }
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn println_from_many_cores() {
        let handles: Vec<_> = (0..4)
            .map(|hart| {
                thread::spawn(move || {
                    for i in 0..10 {
                        println!("println_mul_hart{}: hart {}", i, hart);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn logger_can_be_installed_twice() {
        init_logger(LevelFilter::Warn);
        init_logger(LevelFilter::Info);
        assert_eq!(log::max_level(), LevelFilter::Info);
        log::info!("logger installed");
    }
}
