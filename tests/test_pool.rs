use offthread::pool::{Builder, PoolHandle, Work, WorkBox, WorkerPool};

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct Beep;

impl Work for Beep {
    fn run(self) {
        println!("beep");
    }
}

fn boxed_pool(builder: Builder) -> (PoolHandle<Box<dyn WorkBox>>, WorkerPool<Box<dyn WorkBox>>) {
    builder.build()
}

#[test]
fn type_bounds() {
    fn is_send<T: Send>() {}
    fn is_sync<T: Sync>() {}

    is_send::<WorkerPool<Beep>>();
    is_sync::<WorkerPool<Beep>>();
    is_send::<PoolHandle<Beep>>();
}

#[test]
fn one_thread_basic() {
    let (handle, _pool) = boxed_pool(Builder::new().core_size(1).max_size(1));
    let (tx, rx) = mpsc::sync_channel(0);

    handle
        .send_fn(move || {
            tx.send("hi").unwrap();
        })
        .unwrap();

    assert_eq!("hi", rx.recv().unwrap());
}

#[test]
fn clone_handle() {
    let (handle, _pool) = boxed_pool(Builder::new().core_size(1).max_size(1));
    let (tx, rx) = mpsc::sync_channel(0);

    handle
        .clone()
        .send_fn(move || {
            tx.send("hi").unwrap();
        })
        .unwrap();

    assert_eq!("hi", rx.recv().unwrap());
}

#[test]
fn debug() {
    format!(
        "{:?}",
        boxed_pool(Builder::new().core_size(1).max_size(1))
    );
}

#[test]
fn single_worker_runs_in_order() {
    let (handle, _pool) = boxed_pool(Builder::new().core_size(1).max_size(1));
    let (tx, rx) = mpsc::channel();

    for i in 0..4 {
        let tx = tx.clone();
        handle
            .send_fn(move || {
                tx.send(i).unwrap();
                thread::sleep(Duration::from_millis(20));
            })
            .unwrap();
    }

    for expect in 0..4 {
        assert_eq!(expect, rx.recv().unwrap());
    }
}

#[test]
fn grow_pool_and_reject() {
    let (handle, pool) = boxed_pool(
        Builder::new()
            .core_size(1)
            .max_size(3)
            .backlog_capacity(1),
    );

    // Used as a latch
    let (tx, rx) = mpsc::channel();

    // Core threads aren't pre-started
    assert_eq!(0, pool.size());

    handle
        .try_send_fn(move || {
            tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(500));
        })
        .unwrap();

    assert_eq!(1, pool.size());

    // Wait for the first item to have started
    rx.recv().unwrap();

    for _ in 0..3 {
        handle
            .try_send_fn(|| {
                thread::sleep(Duration::from_millis(500));
            })
            .unwrap();
    }

    assert_eq!(3, pool.size());

    let res = handle.try_send_fn(|| {
        println!("hello");
    });

    assert!(res.is_err());
}

#[test]
fn rejects_past_core_and_backlog() {
    let (handle, pool) = boxed_pool(
        Builder::new()
            .core_size(2)
            .max_size(2)
            .backlog_capacity(1),
    );

    let (started_tx, started_rx) = mpsc::channel();
    let (hold_tx, hold_rx) = mpsc::channel::<()>();
    let hold_rx = Arc::new(std::sync::Mutex::new(hold_rx));

    for _ in 0..2 {
        let started_tx = started_tx.clone();
        let hold_rx = hold_rx.clone();

        handle
            .try_send_fn(move || {
                started_tx.send(()).unwrap();
                let _ = hold_rx.lock().unwrap().recv();
            })
            .unwrap();
    }

    // Both workers are busy
    started_rx.recv().unwrap();
    started_rx.recv().unwrap();
    assert_eq!(2, pool.size());

    // Third item occupies the single backlog slot
    handle.try_send_fn(|| {}).unwrap();

    // Core + backlog exhausted and the pool cannot grow further
    assert!(handle.try_send_fn(|| {}).is_err());

    drop(hold_tx);
}

#[test]
fn send_timeout_expires_when_saturated() {
    let (handle, pool) = boxed_pool(
        Builder::new()
            .core_size(1)
            .max_size(1)
            .backlog_capacity(1),
    );

    let (started_tx, started_rx) = mpsc::channel();
    let (hold_tx, hold_rx) = mpsc::channel::<()>();

    handle
        .try_send_fn(move || {
            started_tx.send(()).unwrap();
            let _ = hold_rx.recv();
        })
        .unwrap();
    started_rx.recv().unwrap();

    handle.try_send_fn(|| {}).unwrap();
    assert_eq!(1, pool.queued());

    let work: Box<dyn WorkBox> = Box::new(|| {});
    let res = handle.send_timeout(work, Duration::from_millis(50));
    assert!(res.is_err());

    drop(hold_tx);
}

#[test]
fn keep_alive_shrinks_pool() {
    let (handle, pool) = boxed_pool(
        Builder::new()
            .core_size(1)
            .max_size(2)
            .keep_alive(Duration::from_millis(50))
            .backlog_capacity(1),
    );

    // Submit until the pool is full
    loop {
        let res = handle.try_send_fn(|| {
            thread::sleep(Duration::from_millis(50));
        });

        if res.is_err() {
            break;
        }
    }

    assert_eq!(2, pool.size());

    // Wait for the extra thread to time out
    thread::sleep(Duration::from_millis(300));

    assert_eq!(1, pool.size());
}

#[test]
fn panic_in_work_keeps_worker() {
    let (handle, pool) = boxed_pool(Builder::new().core_size(1).max_size(1));
    let (tx, rx) = mpsc::channel();

    {
        let tx = tx.clone();
        handle
            .send_fn(move || {
                tx.send(1).unwrap();
                panic!();
            })
            .unwrap();
    }

    assert_eq!(1, rx.recv().unwrap());
    assert_eq!(1, pool.size());

    handle
        .send_fn(move || {
            tx.send(2).unwrap();
        })
        .unwrap();

    assert_eq!(2, rx.recv().unwrap());
}

#[test]
fn shutdown_by_dropping_handle() {
    let (handle, pool) = boxed_pool(Builder::new().core_size(1).max_size(1));
    let cnt = Arc::new(AtomicUsize::new(0));

    for _ in 0..20 {
        let cnt = cnt.clone();
        handle
            .send_fn(move || {
                cnt.fetch_add(1, SeqCst);
            })
            .unwrap();
    }

    drop(handle);

    assert!(pool.is_terminating() || pool.is_terminated());

    pool.await_termination();

    assert_eq!(20, cnt.load(SeqCst));
    assert!(pool.is_terminated());
}

#[test]
fn shutdown_drains_queued_work() {
    let (handle, pool) = boxed_pool(Builder::new().core_size(1).max_size(1));
    let cnt = Arc::new(AtomicUsize::new(0));

    for _ in 0..20 {
        let cnt = cnt.clone();
        handle
            .send_fn(move || {
                cnt.fetch_add(1, SeqCst);
            })
            .unwrap();
    }

    pool.shutdown();

    assert!(pool.is_terminating() || pool.is_terminated());

    pool.await_termination();

    assert_eq!(20, cnt.load(SeqCst));
    assert!(pool.is_terminated());
}

#[test]
fn shutdown_now_discards_queued_work() {
    let (handle, pool) = boxed_pool(Builder::new().core_size(1).max_size(1));
    let cnt = Arc::new(AtomicUsize::new(0));

    for _ in 0..20 {
        let cnt = cnt.clone();
        handle
            .send_fn(move || {
                cnt.fetch_add(1, SeqCst);
                thread::sleep(Duration::from_millis(300));
            })
            .unwrap();
    }

    thread::sleep(Duration::from_millis(50));

    pool.shutdown_now();

    assert!(pool.is_terminating() || pool.is_terminated());

    pool.await_termination();

    assert_eq!(1, cnt.load(SeqCst));
    assert!(pool.is_terminated());
}

#[test]
fn shutdown_idle_pool_terminates() {
    let (handle, pool) = boxed_pool(Builder::new().core_size(2).max_size(2));

    pool.shutdown();
    pool.await_termination();

    assert!(pool.is_terminated());
    drop(handle);
}
