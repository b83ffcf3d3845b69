#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fntrace::transport::unix::UnixSocketConnector;
use fntrace::wire::CaptureEvent;
use fntrace::{current_thread_id, now_ns, MonotonicClock, RelayConfig, RelayState, Tracer};
use fntrace_frontend::{dump_full_uftrace, Collector};

const TRAMPOLINE: u64 = 0xDEAD_0000;
const TIMEOUT: Duration = Duration::from_secs(5);

fn config(socket: &Path) -> RelayConfig {
    RelayConfig {
        socket_path: socket.to_path_buf(),
        capacity: 1 << 12,
        reconnect_delay: Duration::from_millis(20),
        poll_interval: Duration::from_micros(200),
        ..RelayConfig::default()
    }
}

fn start_tracer(socket: &Path) -> Tracer {
    let connector = Box::new(UnixSocketConnector::new(socket));
    Tracer::start(MonotonicClock, connector, &config(socket)).unwrap()
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Runs what the trampolines would run around a call of `function_id`.
fn call(tracer: &Tracer, function_id: u64, body: impl FnOnce()) {
    let return_address = 0x1000 + function_id;
    let mut slot = Box::new(return_address);
    let sp = &mut *slot as *mut u64 as u64;
    unsafe { tracer.on_entry(return_address, function_id, sp, TRAMPOLINE) };
    assert_eq!(*slot, TRAMPOLINE);
    body();
    assert_eq!(tracer.on_exit(), return_address);
}

#[test]
fn capture_over_unix_socket_to_uftrace() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("fntrace.sock");
    let collector = Collector::bind(&socket).unwrap();

    let tracer = Arc::new(start_tracer(&socket));
    assert_eq!(tracer.relay().state(), RelayState::Connected);
    let mut session = collector.accept().unwrap();

    // Not capturing yet, nothing may arrive for this call.
    call(&tracer, 99, || {});

    let before_start = now_ns();
    session.start_capture().unwrap();
    assert!(wait_until(|| tracer.relay().is_capturing()));
    assert!(tracer.session().start_ns() >= before_start);

    call(&tracer, 1, || call(&tracer, 2, || {}));
    let worker = {
        let tracer = Arc::clone(&tracer);
        thread::spawn(move || {
            call(&tracer, 3, || {});
            current_thread_id()
        })
    };
    let worker_tid = worker.join().unwrap();

    session.stop_capture().unwrap();
    let trace = session.collect_until_all_events_sent(TIMEOUT).unwrap();
    session.capture_finished().unwrap();

    assert_eq!(trace.dropped_events, 0);
    assert_eq!(trace.events.len(), 6);
    let main_tid = current_thread_id();
    let function_ids: Vec<Option<u64>> = trace
        .events
        .iter()
        .filter(|e| e.thread_id() == main_tid)
        .map(|e| match e {
            CaptureEvent::FunctionEntry(e) => Some(e.function_id),
            CaptureEvent::FunctionExit(_) => None,
        })
        .collect();
    assert_eq!(function_ids, vec![Some(1), Some(2), None, None]);
    let timestamps: Vec<u64> = trace.events.iter().map(CaptureEvent::timestamp_ns).collect();
    assert!(timestamps
        .iter()
        .all(|&t| t >= tracer.session().start_ns()));

    let out_dir = dir.path().join("uftrace.data");
    fs::create_dir(&out_dir).unwrap();
    let mut tids = dump_full_uftrace(&trace, &out_dir, "app").unwrap();
    tids.sort_unstable();
    let mut expected = vec![main_tid, worker_tid];
    expected.sort_unstable();
    assert_eq!(tids, expected);
    for name in ["info", "task.txt", "sid-00.map"] {
        assert!(out_dir.join(name).exists(), "{} missing", name);
    }
    assert_eq!(fs::read(out_dir.join(format!("{}.dat", main_tid))).unwrap().len(), 4 * 16);
    assert_eq!(fs::read(out_dir.join(format!("{}.dat", worker_tid))).unwrap().len(), 2 * 16);

    tracer.shutdown();
    assert_eq!(tracer.relay().state(), RelayState::Closed);
}

#[test]
fn producer_reconnects_to_restarted_collector() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("fntrace.sock");

    let collector = Collector::bind(&socket).unwrap();
    let tracer = start_tracer(&socket);

    let mut session = collector.accept().unwrap();
    session.start_capture().unwrap();
    assert!(wait_until(|| tracer.relay().is_capturing()));

    drop(session);
    drop(collector);
    assert!(wait_until(|| tracer.relay().state() != RelayState::Connected));
    assert!(!tracer.relay().is_capturing());

    let collector = Collector::bind(&socket).unwrap();
    let mut session = collector.accept().unwrap();
    assert!(wait_until(|| tracer.relay().state() == RelayState::Connected));
    assert!(!tracer.relay().is_capturing());

    session.start_capture().unwrap();
    assert!(wait_until(|| tracer.relay().is_capturing()));
    call(&tracer, 7, || {});
    session.stop_capture().unwrap();
    let trace = session.collect_until_all_events_sent(TIMEOUT).unwrap();
    assert_eq!(trace.events.len(), 2);
}

#[test]
fn producer_without_collector_stays_quiet() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("nobody-listens.sock");

    let tracer = start_tracer(&socket);
    assert_eq!(tracer.relay().state(), RelayState::Disconnected);

    call(&tracer, 1, || {});
    assert!(!tracer.relay().is_capturing());
    assert_eq!(tracer.relay().dropped_events(), 0);

    tracer.shutdown();
    assert_eq!(tracer.relay().state(), RelayState::Closed);
}
