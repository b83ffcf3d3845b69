//! Helpers shared by the unit tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::config::RelayConfig;
use crate::transport::channel::CollectorLink;
use crate::wire::{CaptureEvent, ProducerMessage};

pub const WAIT: Duration = Duration::from_secs(5);

/// Polls `condition` until it holds or [`WAIT`] has passed.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

pub fn config() -> RelayConfig {
    RelayConfig {
        capacity: 1 << 12,
        reconnect_delay: Duration::from_millis(20),
        poll_interval: Duration::from_micros(200),
        batch_size: 64,
        ..RelayConfig::default()
    }
}

#[derive(Debug, Default)]
pub struct Capture {
    pub events: Vec<CaptureEvent>,
    pub dropped_events: u64,
}

/// Receives everything up to and including the end-of-capture message.
pub fn collect_capture(link: &CollectorLink) -> Capture {
    let mut capture = Capture::default();
    loop {
        match link.recv(WAIT) {
            Some(ProducerMessage::CaptureEvent(event)) => capture.events.push(event),
            Some(ProducerMessage::AllEventsSent { dropped_events }) => {
                capture.dropped_events = dropped_events;
                return capture;
            }
            None => panic!("capture did not end, got {} events", capture.events.len()),
        }
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(now_ns: u64) -> Self {
        ManualClock(AtomicU64::new(now_ns))
    }

    pub fn set(&self, now_ns: u64) {
        self.0.store(now_ns, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}
