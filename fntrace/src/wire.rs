//! Messages exchanged with the collector and their binary framing.
//!
//! Producer to collector: one tag byte followed by the fields in declaration order, all little
//! endian. Collector to producer: a single command byte.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::WireError;
use crate::interface::{self, EventRecord};

const TAG_FUNCTION_ENTRY: u8 = 1;
const TAG_FUNCTION_EXIT: u8 = 2;
const TAG_ALL_EVENTS_SENT: u8 = 3;

/// Size of the largest encoded producer message.
pub const MAX_MESSAGE_SIZE: usize = 1 + 4 + 4 + 8 * 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureCommand {
    StartCapture,
    StopCapture,
    CaptureFinished,
}

impl CaptureCommand {
    pub fn to_byte(self) -> u8 {
        match self {
            CaptureCommand::StartCapture => 1,
            CaptureCommand::StopCapture => 2,
            CaptureCommand::CaptureFinished => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, WireError> {
        match byte {
            1 => Ok(CaptureCommand::StartCapture),
            2 => Ok(CaptureCommand::StopCapture),
            3 => Ok(CaptureCommand::CaptureFinished),
            other => Err(WireError::UnknownCommand(other)),
        }
    }
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEvent {
    FunctionEntry(FunctionEntry),
    FunctionExit(FunctionExit),
}

impl CaptureEvent {
    pub fn thread_id(&self) -> u32 {
        match self {
            CaptureEvent::FunctionEntry(e) => e.thread_id,
            CaptureEvent::FunctionExit(e) => e.thread_id,
        }
    }

    pub fn timestamp_ns(&self) -> u64 {
        match self {
            CaptureEvent::FunctionEntry(e) => e.timestamp_ns,
            CaptureEvent::FunctionExit(e) => e.timestamp_ns,
        }
    }
}

impl From<EventRecord> for CaptureEvent {
    fn from(record: EventRecord) -> Self {
        match record {
            EventRecord::FunctionEntry(interface::FunctionEntry {
                process_id,
                thread_id,
                function_id,
                stack_pointer,
                return_address,
                timestamp_ns,
            }) => CaptureEvent::FunctionEntry(FunctionEntry {
                process_id,
                thread_id,
                function_id,
                stack_pointer,
                return_address,
                timestamp_ns,
            }),
            EventRecord::FunctionExit(interface::FunctionExit {
                process_id,
                thread_id,
                timestamp_ns,
            }) => CaptureEvent::FunctionExit(FunctionExit {
                process_id,
                thread_id,
                timestamp_ns,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerMessage {
    CaptureEvent(CaptureEvent),
    /// Last message of a capture. Carries the number of events the producer could not buffer.
    AllEventsSent { dropped_events: u64 },
}

impl ProducerMessage {
    pub fn encode<W: Write>(&self, out: &mut W) -> io::Result<()> {
        match self {
            ProducerMessage::CaptureEvent(CaptureEvent::FunctionEntry(e)) => {
                out.write_u8(TAG_FUNCTION_ENTRY)?;
                out.write_u32::<LittleEndian>(e.process_id)?;
                out.write_u32::<LittleEndian>(e.thread_id)?;
                out.write_u64::<LittleEndian>(e.function_id)?;
                out.write_u64::<LittleEndian>(e.stack_pointer)?;
                out.write_u64::<LittleEndian>(e.return_address)?;
                out.write_u64::<LittleEndian>(e.timestamp_ns)?;
            }
            ProducerMessage::CaptureEvent(CaptureEvent::FunctionExit(e)) => {
                out.write_u8(TAG_FUNCTION_EXIT)?;
                out.write_u32::<LittleEndian>(e.process_id)?;
                out.write_u32::<LittleEndian>(e.thread_id)?;
                out.write_u64::<LittleEndian>(e.timestamp_ns)?;
            }
            ProducerMessage::AllEventsSent { dropped_events } => {
                out.write_u8(TAG_ALL_EVENTS_SENT)?;
                out.write_u64::<LittleEndian>(*dropped_events)?;
            }
        }
        Ok(())
    }

    /// Reads the next message. `Ok(None)` if the stream ended cleanly between two messages.
    pub fn decode<R: Read>(input: &mut R) -> Result<Option<Self>, WireError> {
        let tag = match input.read_u8() {
            Ok(tag) => tag,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let message = match tag {
            TAG_FUNCTION_ENTRY => ProducerMessage::CaptureEvent(CaptureEvent::FunctionEntry(
                FunctionEntry {
                    process_id: input.read_u32::<LittleEndian>()?,
                    thread_id: input.read_u32::<LittleEndian>()?,
                    function_id: input.read_u64::<LittleEndian>()?,
                    stack_pointer: input.read_u64::<LittleEndian>()?,
                    return_address: input.read_u64::<LittleEndian>()?,
                    timestamp_ns: input.read_u64::<LittleEndian>()?,
                },
            )),
            TAG_FUNCTION_EXIT => {
                ProducerMessage::CaptureEvent(CaptureEvent::FunctionExit(FunctionExit {
                    process_id: input.read_u32::<LittleEndian>()?,
                    thread_id: input.read_u32::<LittleEndian>()?,
                    timestamp_ns: input.read_u64::<LittleEndian>()?,
                }))
            }
            TAG_ALL_EVENTS_SENT => ProducerMessage::AllEventsSent {
                dropped_events: input.read_u64::<LittleEndian>()?,
            },
            other => return Err(WireError::UnknownTag(other)),
        };
        Ok(Some(message))
    }
}
