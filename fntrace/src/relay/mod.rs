//! The relay: a bounded lock-free buffer that the payloads push records into, and a background
//! worker that drains it and forwards everything to the collector.
//!
//! Producers only ever touch [`EventRelay::is_capturing`] and [`EventRelay::enqueue`]; both are a
//! handful of atomic operations. Everything that can block (connecting, sending, waiting for
//! capture commands) happens on the worker thread.

use std::fmt;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use crate::config::RelayConfig;
use crate::interface::EventRecord;
use crate::transport::Connector;

mod buffer;
mod worker;

use buffer::EventBuffer;
use worker::Worker;

/// Runs on the worker when a capture starts, before producers see [`EventRelay::is_capturing`]
/// turn true.
pub type CaptureStartHook = Box<dyn Fn() + Send + Sync>;

/// Connection state of the relay.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Uninitialised = 0,
    Connecting = 1,
    Connected = 2,
    Disconnected = 3,
    Closed = 4,
}

impl RelayState {
    fn from_u8(value: u8) -> RelayState {
        match value {
            1 => RelayState::Connecting,
            2 => RelayState::Connected,
            3 => RelayState::Disconnected,
            4 => RelayState::Closed,
            _ => RelayState::Uninitialised,
        }
    }
}

/// State shared between producers, the worker and the owner of the relay.
pub(crate) struct Shared {
    buffer: EventBuffer,
    state: AtomicU8,
    /// Connected and inside a capture. Only the worker writes it.
    capturing: AtomicBool,
    shutdown: AtomicBool,
    /// Records drained while not capturing.
    discarded: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: RelayState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> RelayState {
        RelayState::from_u8(self.state.load(Ordering::Acquire))
    }
}

pub struct EventRelay {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventRelay {
    /// Creates the relay, makes the first connection attempt on the calling thread and starts the
    /// worker. A failed first attempt is not an error: the worker keeps retrying.
    pub fn start(connector: Box<dyn Connector>, config: &RelayConfig) -> io::Result<Self> {
        EventRelay::start_with_hook(connector, config, Box::new(|| {}))
    }

    /// Like [`EventRelay::start`], calling `on_capture_start` whenever a capture starts.
    pub fn start_with_hook(
        mut connector: Box<dyn Connector>,
        config: &RelayConfig,
        on_capture_start: CaptureStartHook,
    ) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            buffer: EventBuffer::new(config.capacity.max(1)),
            state: AtomicU8::new(RelayState::Uninitialised as u8),
            capturing: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            discarded: AtomicU64::new(0),
        });

        shared.set_state(RelayState::Connecting);
        let connection = match connector.connect() {
            Ok(connection) => {
                info!("Connected to collector");
                shared.set_state(RelayState::Connected);
                Some(connection)
            }
            Err(e) => {
                warn!(
                    "Could not connect to collector, retrying every {:?}: {}",
                    config.reconnect_delay, e
                );
                shared.set_state(RelayState::Disconnected);
                None
            }
        };

        let worker = Worker::new(
            Arc::clone(&shared),
            connector,
            connection,
            config.clone(),
            on_capture_start,
        );
        let handle = thread::Builder::new()
            .name("fntrace-relay".into())
            .spawn(move || worker.run())
            .map_err(|e| {
                shared.set_state(RelayState::Closed);
                e
            })?;

        Ok(EventRelay {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// A relay that never connects. Used when the worker thread cannot be started.
    pub fn closed(capacity: usize) -> Self {
        EventRelay {
            shared: Arc::new(Shared {
                buffer: EventBuffer::new(capacity.max(1)),
                state: AtomicU8::new(RelayState::Closed as u8),
                capturing: AtomicBool::new(false),
                shutdown: AtomicBool::new(true),
                discarded: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Whether the collector currently wants events. Producers skip building records otherwise.
    ///
    /// Once this returns true, everything the capture start hook wrote is visible.
    #[inline]
    pub fn is_capturing(&self) -> bool {
        self.shared.capturing.load(Ordering::Acquire)
    }

    /// Hands `record` to the worker. Never blocks; returns `false` if it had to be dropped
    /// because the buffer is full.
    #[inline]
    pub fn enqueue(&self, record: EventRecord) -> bool {
        self.shared.buffer.push(record)
    }

    pub fn state(&self) -> RelayState {
        self.shared.state()
    }

    /// Records dropped on a full buffer since the relay was created.
    pub fn dropped_events(&self) -> u64 {
        self.shared.buffer.dropped()
    }

    /// Records thrown away by the worker because no capture was running.
    pub fn discarded_events(&self) -> u64 {
        self.shared.discarded.load(Ordering::Relaxed)
    }

    /// Stops the worker after it has forwarded everything still buffered, and closes the
    /// connection. Must only be called once producers have stopped. Idempotent.
    pub fn shutdown(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };

        debug!("Shutting down relay");
        self.shared.shutdown.store(true, Ordering::Release);
        if handle.join().is_err() {
            warn!("Relay worker panicked");
            self.shared.capturing.store(false, Ordering::Relaxed);
            self.shared.set_state(RelayState::Closed);
        }
    }

    /// Called in the child after `fork`. The worker thread was not copied into the child, so the
    /// relay can never deliver anything there.
    pub(crate) fn close_after_fork(&self) {
        self.shared.capturing.store(false, Ordering::Relaxed);
        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.shared.set_state(RelayState::Closed);
        // The lock may have been held by a thread that does not exist in the child.
        if let Ok(mut worker) = self.worker.try_lock() {
            // Joining a thread of the parent is not possible.
            mem::forget(worker.take());
        }
    }
}

impl Drop for EventRelay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for EventRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRelay")
            .field("state", &self.state())
            .field("capturing", &self.is_capturing())
            .field("capacity", &self.shared.buffer.capacity())
            .field("dropped_events", &self.dropped_events())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{FunctionEntry, FunctionExit};
    use crate::testing::{self, wait_until, WAIT};
    use crate::transport::channel::{self, CollectorLink};
    use crate::wire::CaptureEvent;
    use std::time::Duration;

    fn exit(thread_id: u32, timestamp_ns: u64) -> EventRecord {
        EventRecord::FunctionExit(FunctionExit {
            process_id: 7,
            thread_id,
            timestamp_ns,
        })
    }

    fn connected_relay(
        config: &RelayConfig,
    ) -> (EventRelay, channel::ChannelEndpoint, CollectorLink) {
        let (connector, endpoint) = channel::channel();
        let relay = EventRelay::start(Box::new(connector), config).unwrap();
        assert_eq!(relay.state(), RelayState::Connected);
        let link = endpoint.accept(WAIT).expect("relay connects on construction");
        (relay, endpoint, link)
    }

    fn start_capture(relay: &EventRelay, link: &CollectorLink) {
        link.start_capture().unwrap();
        assert!(wait_until(|| relay.is_capturing()));
    }

    #[test]
    fn forwards_only_while_capturing() {
        let (relay, _endpoint, link) = connected_relay(&testing::config());
        assert!(!relay.is_capturing());

        relay.enqueue(exit(42, 1));
        assert!(wait_until(|| relay.discarded_events() == 1));
        assert_eq!(link.recv(Duration::from_millis(20)), None);

        start_capture(&relay, &link);
        let entry = EventRecord::FunctionEntry(FunctionEntry {
            process_id: 7,
            thread_id: 42,
            function_id: 1,
            stack_pointer: 0x7FFF_FFF0,
            return_address: 0x1000,
            timestamp_ns: 2,
        });
        assert!(relay.enqueue(entry));
        assert!(relay.enqueue(exit(42, 3)));
        assert!(relay.enqueue(exit(42, 4)));

        link.stop_capture().unwrap();
        let capture = testing::collect_capture(&link);
        assert_eq!(
            capture.events,
            vec![
                CaptureEvent::from(entry),
                CaptureEvent::from(exit(42, 3)),
                CaptureEvent::from(exit(42, 4)),
            ]
        );
        assert_eq!(capture.dropped_events, 0);
        assert!(!relay.is_capturing());
        assert_eq!(relay.state(), RelayState::Connected);

        link.capture_finished().unwrap();
        relay.enqueue(exit(42, 5));
        assert!(wait_until(|| relay.discarded_events() == 2));
    }

    #[test]
    fn duplicated_commands_have_no_effect() {
        let (relay, _endpoint, link) = connected_relay(&testing::config());
        start_capture(&relay, &link);
        link.start_capture().unwrap();
        relay.enqueue(exit(42, 1));

        link.stop_capture().unwrap();
        link.stop_capture().unwrap();
        let capture = testing::collect_capture(&link);
        assert_eq!(capture.events.len(), 1);
        // The second stop must not produce a second end of capture.
        assert_eq!(link.recv(Duration::from_millis(50)), None);

        link.capture_finished().unwrap();
        link.capture_finished().unwrap();
        start_capture(&relay, &link);
    }

    #[test]
    fn skipped_commands_are_implied() {
        let (relay, _endpoint, link) = connected_relay(&testing::config());

        // Stop without start still ends a (empty) capture.
        link.stop_capture().unwrap();
        let capture = testing::collect_capture(&link);
        assert!(capture.events.is_empty());
        assert!(!relay.is_capturing());

        // Start while stopped finishes the old capture first.
        start_capture(&relay, &link);

        // Finished while capturing stops first.
        relay.enqueue(exit(42, 1));
        link.capture_finished().unwrap();
        let capture = testing::collect_capture(&link);
        assert_eq!(capture.events.len(), 1);
        assert!(!relay.is_capturing());
    }

    #[test]
    fn disconnect_stops_capturing_and_reconnects() {
        let mut config = testing::config();
        config.reconnect_delay = Duration::from_millis(50);
        let (relay, endpoint, link) = connected_relay(&config);
        start_capture(&relay, &link);

        drop(link);
        assert!(wait_until(|| relay.state() != RelayState::Connected));
        assert!(!relay.is_capturing());

        let link = endpoint.accept(WAIT).expect("relay reconnects");
        assert!(wait_until(|| relay.state() == RelayState::Connected));
        assert!(!relay.is_capturing());

        start_capture(&relay, &link);
        relay.enqueue(exit(42, 1));
        relay.enqueue(exit(42, 2));
        link.stop_capture().unwrap();
        assert_eq!(testing::collect_capture(&link).events.len(), 2);
    }

    #[test]
    fn unreachable_collector_leaves_relay_disconnected() {
        let (connector, endpoint) = channel::channel();
        drop(endpoint);
        let relay = EventRelay::start(Box::new(connector), &testing::config()).unwrap();
        assert_eq!(relay.state(), RelayState::Disconnected);
        assert!(!relay.is_capturing());
        relay.shutdown();
        assert_eq!(relay.state(), RelayState::Closed);
    }

    #[test]
    fn shutdown_drains_and_closes() {
        let (relay, _endpoint, link) = connected_relay(&testing::config());
        start_capture(&relay, &link);
        for t in 0..100 {
            relay.enqueue(exit(42, t));
        }

        relay.shutdown();
        assert_eq!(relay.state(), RelayState::Closed);
        assert!(!relay.is_capturing());
        let capture = testing::collect_capture(&link);
        assert_eq!(capture.events.len(), 100);

        // Idempotent.
        relay.shutdown();
    }

    #[test]
    fn reports_dropped_events_at_end_of_capture() {
        let mut config = testing::config();
        config.capacity = 4;
        // Keep the worker asleep while the buffer overflows.
        config.poll_interval = Duration::from_millis(200);
        let (relay, _endpoint, link) = connected_relay(&config);
        start_capture(&relay, &link);

        let accepted = (0..10).filter(|&t| relay.enqueue(exit(42, t))).count() as u64;
        let dropped = relay.dropped_events();
        assert_eq!(accepted + dropped, 10);

        link.stop_capture().unwrap();
        let capture = testing::collect_capture(&link);
        assert_eq!(capture.events.len() as u64, accepted);
        assert_eq!(capture.dropped_events, dropped);
    }

    #[test]
    fn preserves_per_thread_order() {
        const THREADS: u32 = 4;
        const PER_THREAD: u64 = 2000;

        let (relay, _endpoint, link) = connected_relay(&testing::config());
        let relay = Arc::new(relay);
        start_capture(&relay, &link);

        let producers: Vec<_> = (0..THREADS)
            .map(|tid| {
                let relay = Arc::clone(&relay);
                thread::spawn(move || {
                    for t in 0..PER_THREAD {
                        while !relay.enqueue(exit(tid, t)) {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        link.stop_capture().unwrap();
        let capture = testing::collect_capture(&link);
        assert_eq!(capture.events.len() as u64, THREADS as u64 * PER_THREAD);
        for tid in 0..THREADS {
            let timestamps: Vec<u64> = capture
                .events
                .iter()
                .filter(|e| e.thread_id() == tid)
                .map(CaptureEvent::timestamp_ns)
                .collect();
            assert_eq!(timestamps, (0..PER_THREAD).collect::<Vec<_>>());
        }
    }

    #[test]
    fn capture_start_hook_runs_once_per_capture() {
        let (connector, endpoint) = channel::channel();
        let starts = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&starts);
        let relay = EventRelay::start_with_hook(
            Box::new(connector),
            &testing::config(),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        let link = endpoint.accept(WAIT).unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 0);

        start_capture(&relay, &link);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        link.start_capture().unwrap();
        link.stop_capture().unwrap();
        testing::collect_capture(&link);
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        link.capture_finished().unwrap();
        start_capture(&relay, &link);
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn records_buffered_before_start_are_not_sent() {
        let mut config = testing::config();
        // Buffer and command land while the worker sleeps, so it sees both in one iteration.
        config.poll_interval = Duration::from_millis(200);
        let (relay, _endpoint, link) = connected_relay(&config);

        relay.enqueue(exit(42, 1));
        start_capture(&relay, &link);
        assert_eq!(relay.discarded_events(), 1);

        relay.enqueue(exit(42, 2));
        link.stop_capture().unwrap();
        let capture = testing::collect_capture(&link);
        assert_eq!(capture.events, vec![CaptureEvent::from(exit(42, 2))]);
    }

    #[test]
    fn closed_relay_never_captures() {
        let relay = EventRelay::closed(8);
        assert_eq!(relay.state(), RelayState::Closed);
        assert!(!relay.is_capturing());
        assert!(format!("{:?}", relay).contains("Closed"));
        relay.shutdown();
    }
}
