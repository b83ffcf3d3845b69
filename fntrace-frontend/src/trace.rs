use fntrace::wire::CaptureEvent;

/// Everything one capture delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedTrace {
    /// In the order received, so per thread in the order they happened.
    pub events: Vec<CaptureEvent>,
    /// Events the producer had to drop because its buffer was full.
    pub dropped_events: u64,
}

impl CapturedTrace {
    /// Thread ids in order of first appearance.
    pub fn thread_ids(&self) -> Vec<u32> {
        let mut tids = Vec::new();
        for event in &self.events {
            if !tids.contains(&event.thread_id()) {
                tids.push(event.thread_id());
            }
        }
        tids
    }

    pub fn process_id(&self) -> Option<u32> {
        self.events.first().map(|event| match event {
            CaptureEvent::FunctionEntry(e) => e.process_id,
            CaptureEvent::FunctionExit(e) => e.process_id,
        })
    }
}
