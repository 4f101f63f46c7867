use offthread::{EventLoop, Handle, LoopThread};

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[test]
fn type_bounds() {
    fn is_send<T: Send>() {}
    fn is_sync<T: Sync>() {}

    is_send::<Handle>();
    is_sync::<Handle>();
    is_send::<EventLoop>();
}

#[test]
fn delivers_in_post_order() {
    let (handle, event_loop) = EventLoop::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for i in 0..10 {
        let seen = seen.clone();
        handle
            .post(move || seen.lock().unwrap().push(i))
            .unwrap();
    }

    handle.quit_safely();
    event_loop.run();

    assert_eq!((0..10).collect::<Vec<_>>(), *seen.lock().unwrap());
}

#[test]
fn post_from_other_threads() {
    let (handle, event_loop) = EventLoop::new();
    let seen = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let handle = handle.clone();
            let seen = seen.clone();

            std::thread::spawn(move || {
                for _ in 0..25 {
                    let seen = seen.clone();
                    handle.post(move || { seen.fetch_add(1, SeqCst); }).unwrap();
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }

    handle.quit_safely();
    event_loop.run();

    assert_eq!(100, seen.load(SeqCst));
}

#[test]
fn post_after_quit_fails() {
    let (handle, _event_loop) = EventLoop::new();

    assert!(handle.is_open());
    handle.quit();
    assert!(!handle.is_open());
    assert!(handle.post(|| {}).is_err());
}

#[test]
fn post_after_quit_safely_fails() {
    let (handle, _event_loop) = EventLoop::new();

    handle.quit_safely();
    assert!(handle.post(|| {}).is_err());
}

#[test]
fn quit_discards_pending_messages() {
    let (handle, event_loop) = EventLoop::new();
    let seen = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        let seen = seen.clone();
        handle
            .post(move || { seen.fetch_add(1, SeqCst); })
            .unwrap();
    }

    handle.quit();
    event_loop.run();

    assert_eq!(0, seen.load(SeqCst));
}

#[test]
fn quit_safely_drains_pending_messages() {
    let (handle, event_loop) = EventLoop::new();
    let seen = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        let seen = seen.clone();
        handle
            .post(move || { seen.fetch_add(1, SeqCst); })
            .unwrap();
    }

    handle.quit_safely();
    event_loop.run();

    assert_eq!(5, seen.load(SeqCst));
}

#[test]
fn loop_ends_when_handles_dropped() {
    let (handle, event_loop) = EventLoop::new();
    let (tx, rx) = mpsc::channel();

    handle.post(move || tx.send(1).unwrap()).unwrap();
    drop(handle);

    // recv fails once the channel closes, ending the loop
    event_loop.run();

    assert_eq!(1, rx.recv().unwrap());
}

#[test]
fn loop_thread_delivers() {
    let lt = LoopThread::spawn().unwrap();
    let (tx, rx) = mpsc::channel();

    lt.handle().post(move || tx.send("hi").unwrap()).unwrap();

    assert_eq!("hi", rx.recv_timeout(Duration::from_secs(1)).unwrap());

    lt.join();
}

#[test]
fn loop_thread_runs_setup_before_messages() {
    let (tx, rx) = mpsc::channel();
    let setup_tx = tx.clone();

    let lt = LoopThread::builder()
        .name("owner")
        .on_ready(move || setup_tx.send(1).unwrap())
        .spawn()
        .unwrap();

    lt.handle().post(move || tx.send(2).unwrap()).unwrap();

    assert_eq!(1, rx.recv_timeout(Duration::from_secs(1)).unwrap());
    assert_eq!(2, rx.recv_timeout(Duration::from_secs(1)).unwrap());
}

#[test]
fn loop_thread_drop_delivers_then_joins() {
    let seen = Arc::new(AtomicUsize::new(0));

    {
        let lt = LoopThread::spawn().unwrap();

        for _ in 0..5 {
            let seen = seen.clone();
            lt.handle()
                .post(move || { seen.fetch_add(1, SeqCst); })
                .unwrap();
        }
    }

    assert_eq!(5, seen.load(SeqCst));
}

#[test]
fn loop_thread_quit_stops_accepting() {
    let lt = LoopThread::spawn().unwrap();

    lt.quit();

    assert!(lt.handle().post(|| {}).is_err());
}

#[test]
fn loop_thread_quit_safely_stops_accepting() {
    let lt = LoopThread::spawn().unwrap();

    lt.quit_safely();

    assert!(lt.handle().post(|| {}).is_err());
}

#[test]
fn loop_thread_forwards_panic_on_join() {
    let lt = LoopThread::spawn().unwrap();

    lt.handle().post(|| panic!("owner thread failure")).unwrap();

    catch_unwind(AssertUnwindSafe(move || lt.join())).unwrap_err();
}
