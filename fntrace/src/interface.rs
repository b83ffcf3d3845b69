/// One in-flight instrumented call, as remembered between its entry and exit payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenCall {
    /// Where the instrumented function would have returned to, before we redirected it.
    pub return_address: u64,
    pub timestamp_ns: u64,
}

// Open calls are the only per-frame state we keep; keep them at two words.
const _: () = assert!(core::mem::size_of::<OpenCall>() == 16);

/// Event produced by the payloads and moved by value through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRecord {
    FunctionEntry(FunctionEntry),
    FunctionExit(FunctionExit),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionEntry {
    pub process_id: u32,
    pub thread_id: u32,
    pub function_id: u64,
    pub stack_pointer: u64,
    pub return_address: u64,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionExit {
    pub process_id: u32,
    pub thread_id: u32,
    pub timestamp_ns: u64,
}

impl EventRecord {
    pub fn thread_id(&self) -> u32 {
        match self {
            EventRecord::FunctionEntry(e) => e.thread_id,
            EventRecord::FunctionExit(e) => e.thread_id,
        }
    }

    pub fn timestamp_ns(&self) -> u64 {
        match self {
            EventRecord::FunctionEntry(e) => e.timestamp_ns,
            EventRecord::FunctionExit(e) => e.timestamp_ns,
        }
    }
}

impl From<FunctionEntry> for EventRecord {
    fn from(entry: FunctionEntry) -> Self {
        EventRecord::FunctionEntry(entry)
    }
}

impl From<FunctionExit> for EventRecord {
    fn from(exit: FunctionExit) -> Self {
        EventRecord::FunctionExit(exit)
    }
}
