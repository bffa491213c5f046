use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use xv6_bio::consts::fs::{BSIZE, FSSIZE, NBUF};
use xv6_bio::{Kernel, RamDisk, RamDiskConfig};

fn boot(config: RamDiskConfig) -> (Arc<RamDisk>, Arc<Kernel>) {
    let disk = RamDisk::new(config);
    let kernel = Kernel::boot(Arc::clone(&disk));
    (disk, Arc::new(kernel))
}

fn cached(kernel: &Kernel, dev: u32, blockno: u32) -> bool {
    kernel
        .bcache
        .lru_order()
        .iter()
        .any(|b| b.dev == dev && b.blockno == blockno)
}

#[test]
fn bread_returns_disk_contents() {
    let (disk, kernel) = boot(RamDiskConfig::default());
    disk.load(0, 9, b"superblock");

    let b = kernel.bcache.bread(0, 9);
    assert!(b.valid());
    assert!(!b.dirty());
    assert_eq!(&b.data()[..10], b"superblock");
    assert!(b.data()[10..].iter().all(|&x| x == 0));
    drop(b);

    assert_eq!(disk.reads(), 1);
}

#[test]
fn concurrent_get_of_one_block_reads_once() {
    let (disk, kernel) = boot(RamDiskConfig {
        latency: Duration::from_millis(20),
        ..Default::default()
    });
    disk.load(0, 5, &[0x5a; BSIZE]);

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let kernel = Arc::clone(&kernel);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let b = kernel.bcache.bread(0, 5);
                (b.index(), b.data()[BSIZE - 1])
            })
        })
        .collect();
    let seen: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(seen[0], seen[1]);
    assert_eq!(seen[0].1, 0x5a);
    assert_eq!(disk.reads(), 1);
    let entries: Vec<_> = kernel
        .bcache
        .lru_order()
        .into_iter()
        .filter(|b| b.blockno == 5)
        .collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].refcnt, 0);
}

#[test]
fn one_block_past_capacity_recycles_the_oldest() {
    let (disk, kernel) = boot(RamDiskConfig::default());
    let n = NBUF as u32;

    for blockno in 1..=n {
        kernel.bcache.bread(0, blockno).brelse();
    }
    assert_eq!(disk.reads(), NBUF);
    assert!(cached(&kernel, 0, 1));

    kernel.bcache.bread(0, n + 1).brelse();
    assert_eq!(disk.reads(), NBUF + 1);
    assert!(!cached(&kernel, 0, 1));
    assert!(cached(&kernel, 0, 2));

    kernel.bcache.bread(0, 1).brelse();
    assert_eq!(disk.reads(), NBUF + 2);
    assert_eq!(disk.completed().last().map(|t| t.blockno), Some(1));
}

#[test]
fn release_moves_entry_to_most_recently_used() {
    let (_disk, kernel) = boot(RamDiskConfig::default());
    for blockno in [3, 4, 5] {
        kernel.bcache.bread(0, blockno).brelse();
    }
    kernel.bcache.bread(0, 3).brelse();

    let order: Vec<u32> = kernel.bcache.lru_order().iter().map(|b| b.blockno).collect();
    assert_eq!(order, vec![3, 5, 4]);
}

#[test]
fn write_release_read_needs_no_second_transfer() {
    let (disk, kernel) = boot(RamDiskConfig::default());

    let mut b = kernel.bcache.bread(1, 10);
    b.data_mut()[..4].copy_from_slice(b"xv6!");
    b.bwrite();
    assert!(b.valid());
    assert!(!b.dirty());
    b.brelse();
    assert_eq!((disk.reads(), disk.writes()), (1, 1));
    assert_eq!(&disk.dump(1, 10)[..4], b"xv6!");

    let b = kernel.bcache.bread(1, 10);
    assert_eq!(&b.data()[..4], b"xv6!");
    drop(b);
    assert_eq!((disk.reads(), disk.writes()), (1, 1));
}

#[test]
fn same_block_on_two_devices_is_two_entries() {
    let (disk, kernel) = boot(RamDiskConfig::default());
    disk.load(0, 2, b"zero");
    disk.load(1, 2, b"one");

    let a = kernel.bcache.bread(0, 2);
    let b = kernel.bcache.bread(1, 2);
    assert_ne!(a.index(), b.index());
    assert_eq!(&a.data()[..4], b"zero");
    assert_eq!(&b.data()[..3], b"one");
}

#[test]
fn largest_device_number_gets_its_own_entry() {
    let (_disk, kernel) = boot(RamDiskConfig::default());
    assert!(kernel.bcache.lru_order().is_empty());

    let b = kernel.bcache.bget(u32::MAX, 0);
    assert!(!b.valid());
    assert_eq!((b.dev(), b.blockno()), (u32::MAX, 0));
    let index = b.index();
    drop(b);

    let order = kernel.bcache.lru_order();
    assert_eq!(order.len(), 1);
    assert_eq!((order[0].index, order[0].dev, order[0].blockno), (index, u32::MAX, 0));
    assert_eq!(kernel.bcache.bget(u32::MAX, 0).index(), index);
}

#[test]
fn pinned_buffer_survives_cache_pressure() {
    let (disk, kernel) = boot(RamDiskConfig::default());

    let b = kernel.bcache.bread(0, 1);
    b.pin();
    let index = b.index();
    drop(b);

    for blockno in 2..(NBUF as u32 + 10) {
        kernel.bcache.bread(0, blockno).brelse();
    }
    let info = kernel
        .bcache
        .lru_order()
        .into_iter()
        .find(|b| b.blockno == 1)
        .unwrap();
    assert_eq!((info.index, info.refcnt), (index, 1));

    let reads = disk.reads();
    let b = kernel.bcache.bread(0, 1);
    assert_eq!(disk.reads(), reads);
    b.unpin();
    drop(b);
    assert_eq!(kernel.bcache.lru_order()[0].refcnt, 0);
}

#[test]
fn eviction_passes_over_dirty_buffers() {
    let (disk, kernel) = boot(RamDiskConfig::default());

    let mut b = kernel.bcache.bread(0, 1);
    b.data_mut()[0] = 7;
    b.set_dirty();
    b.brelse();

    for blockno in 2..(NBUF as u32 + 10) {
        kernel.bcache.bread(0, blockno).brelse();
    }
    assert!(cached(&kernel, 0, 1));
    assert_eq!(disk.writes(), 0);
    assert_eq!(disk.dump(0, 1)[0], 0);

    let reads = disk.reads();
    let mut b = kernel.bcache.bread(0, 1);
    assert_eq!(disk.reads(), reads);
    assert!(b.dirty());
    assert_eq!(b.data()[0], 7);
    b.bwrite();
    assert!(!b.dirty());
    drop(b);
    assert_eq!(disk.dump(0, 1)[0], 7);
}

#[test]
fn holders_of_one_block_are_mutually_exclusive() {
    let (disk, kernel) = boot(RamDiskConfig::default());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let kernel = Arc::clone(&kernel);
            thread::spawn(move || {
                for _ in 0..25 {
                    let mut b = kernel.bcache.bread(0, 7);
                    let n = u32::from_le_bytes(b.data()[..4].try_into().unwrap());
                    thread::yield_now();
                    b.data_mut()[..4].copy_from_slice(&(n + 1).to_le_bytes());
                    b.bwrite();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let b = kernel.bcache.bread(0, 7);
    assert_eq!(u32::from_le_bytes(b.data()[..4].try_into().unwrap()), 100);
    drop(b);
    assert_eq!(&disk.dump(0, 7)[..4], &100u32.to_le_bytes());
    assert_eq!(disk.reads(), 1);
    assert_eq!(disk.writes(), 100);
}

#[test]
fn many_threads_many_blocks() {
    let (disk, kernel) = boot(RamDiskConfig::default());
    for blockno in 0..64u32 {
        disk.load(0, blockno, &blockno.to_le_bytes());
    }

    let handles: Vec<_> = (0..6u32)
        .map(|t| {
            let kernel = Arc::clone(&kernel);
            thread::spawn(move || {
                for i in 0..200u32 {
                    let blockno = (i * 7 + t * 13) % 64;
                    let b = kernel.bcache.bread(0, blockno);
                    assert_eq!(&b.data()[..4], &blockno.to_le_bytes());
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let entries = kernel.bcache.lru_order();
    assert!(entries.len() <= NBUF);
    assert!(entries.iter().all(|b| b.refcnt == 0));
    let mut keys: Vec<_> = entries.iter().map(|b| (b.dev, b.blockno)).collect();
    keys.sort_unstable();
    keys.dedup();
    assert_eq!(keys.len(), entries.len());
}

#[test]
#[should_panic(expected = "bget: no buffers")]
fn every_buffer_held_is_fatal() {
    let (_disk, kernel) = boot(RamDiskConfig::default());
    let held: Vec<_> = (0..NBUF as u32).map(|i| kernel.bcache.bget(0, i)).collect();
    let _ = kernel.bcache.bget(0, NBUF as u32);
    drop(held);
}

#[test]
#[should_panic(expected = "bget: no buffers")]
fn every_buffer_dirty_is_fatal() {
    let (_disk, kernel) = boot(RamDiskConfig::default());
    for i in 0..NBUF as u32 {
        kernel.bcache.bread(0, i).set_dirty();
    }
    let _ = kernel.bcache.bget(0, NBUF as u32);
}

#[test]
#[should_panic(expected = "bget: blockno 1000 out of range")]
fn block_past_device_end_is_fatal() {
    let (_disk, kernel) = boot(RamDiskConfig::default());
    let _ = kernel.bcache.bread(0, FSSIZE as u32);
}

#[test]
#[should_panic(expected = "buf unpin not match")]
fn unpin_without_pin_is_fatal() {
    let (_disk, kernel) = boot(RamDiskConfig::default());
    let b = kernel.bcache.bread(0, 1);
    b.unpin();
}

#[test]
fn release_from_another_thread_is_fatal() {
    let (_disk, kernel) = boot(RamDiskConfig::default());
    let b = kernel.bcache.bread(0, 1);
    let r = thread::scope(|s| s.spawn(move || b.brelse()).join());
    assert!(r.is_err());
}
