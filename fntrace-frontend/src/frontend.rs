use std::collections::HashMap;
use std::fs::{self, File};
use std::io::prelude::*;
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use fntrace::wire::CaptureEvent;
use log::{debug, info, warn};

use crate::error::FrontendError;
use crate::trace::CapturedTrace;

const UFTRACE_ENTRY: u64 = 0;
const UFTRACE_EXIT: u64 = 1;
const MAX_DEPTH: usize = (1 << 10) - 1;

/// Dumps the trace with some faked metadata into the given folder. Uses the same format as uftrace,
/// which should be used to parse them.
///
/// Function ids take the place of addresses. Will NOT generate symbols! To get names, write a
/// symbol file mapping each function id to its name.
///
/// # Arguments
///
/// * `trace` - what one capture delivered
/// * `out_dir` - folder into which the resulting trace is dumped. Has to exist.
/// * `binary_name` - only relevant for the symbol file. Generated metadata instructs uftrace where
///   to look for it.
///
/// Returns the thread ids a trace file was written for.
pub fn dump_full_uftrace(
    trace: &CapturedTrace,
    out_dir: impl AsRef<Path>,
    binary_name: &str,
) -> Result<Vec<u32>, FrontendError> {
    let out_dir = out_dir.as_ref();
    let pid = trace.process_id().unwrap_or(0);
    let sid = "00";

    // First lets create all traces.
    let tids = dump_traces(trace, out_dir, false)?;

    if tids.is_empty() {
        warn!("Trace is empty!");
        return Ok(tids);
    }

    info!("Creating uftrace data dir at {}", out_dir.display());
    let mut info: Vec<u8> = Vec::new();

    // /info HEADER
    // magic
    info.extend(b"Ftrace!\x00");
    // version. we are using version 4 of fileformat
    info.write_u32::<LittleEndian>(4)?;
    // header size. 0x28 == 40 bytes
    info.write_u16::<LittleEndian>(40)?;
    // endianness = 1
    info.push(1);
    // elf_ident[EI_CLASS]. always 2 for 64bit
    info.push(2);
    // feature flags
    const TASK_SESSION: u64 = 1 << 1; // needed.
    const SYM_REL_ADDR: u64 = 1 << 5;
    info.write_u64::<LittleEndian>(TASK_SESSION | SYM_REL_ADDR)?;
    // info flags
    const CMDLINE: u64 = 1 << 3; // needed, else --dump chrome outputs invalid json.
    // needed, since uftrace uses this to determine how to interpret task.txt
    const TASKINFO: u64 = 1 << 7;
    info.write_u64::<LittleEndian>(CMDLINE | TASKINFO)?;
    // mstack. disable in feature flags, so 0
    info.write_u16::<LittleEndian>(0)?;
    // reserved
    info.write_u16::<LittleEndian>(0)?;
    info.write_u16::<LittleEndian>(0)?;
    info.write_u16::<LittleEndian>(0)?;
    // /info END OF HEADER

    writeln!(info, "cmdline:{}", binary_name)?;
    writeln!(info, "taskinfo:lines=2")?;
    writeln!(info, "taskinfo:nr_tid={}", tids.len())?;
    write!(info, "taskinfo:tids={}", tids[0])?;
    for tid in &tids[1..] {
        write!(info, ",{}", tid)?;
    }
    writeln!(info)?;
    fs::write(out_dir.join("info"), &info)?;
    debug!("  Wrote ./info, tids = {:?}", tids);

    let mut taskfile = File::create(out_dir.join("task.txt"))?;
    writeln!(
        taskfile,
        "SESS timestamp=0.0 pid={} sid={} exename=\"{}\"",
        pid, sid, binary_name
    )?;
    for tid in &tids {
        writeln!(taskfile, "TASK timestamp=0.0 tid={} pid={}", tid, pid)?;
    }
    drop(taskfile);
    debug!("  Wrote ./task.txt, pid = {}, sid = {}", pid, sid);

    let mut mapfile = File::create(out_dir.join(format!("sid-{}.map", sid)))?;
    writeln!(
        mapfile,
        "000000000000-ffffffffffff r-xp 00000000 00:00 0                          {}",
        binary_name
    )?;
    writeln!(
        mapfile,
        "ffffffffffff-ffffffffffff rw-p 00000000 00:00 0                          [stack]"
    )?;
    debug!("  Wrote ./sid-{}.map", sid);

    info!(
        "Addresses are function ids. Write `<id> T <name>` lines to {}/{}.sym to get names",
        out_dir.display(),
        binary_name
    );

    Ok(tids)
}

/// Dumps only the record stream to disk, without additional metadata.
///
/// The records of all threads go into `outfile`. The format is the same as uftrace's, but is not
/// directly parsable due to the missing metadata.
///
/// # Format
/// Packed array of uftrace_record structs
/// ```c
/// struct uftrace_record {
///     uint64_t time;
///     uint64_t type:   2;
///     uint64_t more:   1;
///     uint64_t magic:  3;
///     uint64_t depth:  10;
///     uint64_t addr:   48; /* child ip or uftrace_event_id */
/// };
/// ```
pub fn dump_trace(trace: &CapturedTrace, outfile: impl AsRef<Path>) -> Result<(), FrontendError> {
    dump_traces(trace, outfile.as_ref(), true)?;
    Ok(())
}

fn dump_traces(
    trace: &CapturedTrace,
    outpath: &Path,
    singlefile: bool,
) -> Result<Vec<u32>, FrontendError> {
    // Uftraces trace format: a bunch of 64-bit fields, See
    // https://github.com/namhyung/uftrace/wiki/Data-Format
    //
    // Array of 2x64 bit unsigned long: `[{time: u64, address: u64}, ...]`
    // Since addresses are only using the low 48 bits, metadata (mainly function entry/exit) is
    // saved in the remaining 16 bits.
    info!("Saving {} events to disk", trace.events.len());

    let tids = trace.thread_ids();
    let mut out = Vec::<u8>::with_capacity(16 * trace.events.len());

    // One shadow stack of open entries per thread. Exits carry neither function nor depth.
    let mut open: HashMap<u32, Vec<u64>> = HashMap::new();

    // Per thread, loop through the events and keep only the relevant ones.
    let rounds: Vec<Option<u32>> = if singlefile {
        vec![None]
    } else {
        tids.iter().copied().map(Some).collect()
    };
    for current_tid in rounds {
        out.clear();

        for event in &trace.events {
            let tid = event.thread_id();
            if current_tid.is_some_and(|current| current != tid) {
                continue;
            }
            let stack = open.entry(tid).or_default();

            match event {
                CaptureEvent::FunctionEntry(e) => {
                    let depth = stack.len();
                    write_event(&mut out, e.timestamp_ns, e.function_id, depth, UFTRACE_ENTRY)?;
                    stack.push(e.function_id);
                }
                CaptureEvent::FunctionExit(e) => match stack.pop() {
                    Some(function_id) => {
                        let depth = stack.len();
                        write_event(&mut out, e.timestamp_ns, function_id, depth, UFTRACE_EXIT)?;
                    }
                    None => warn!("Exit without entry on thread {}, skipping", tid),
                },
            }
        }

        if !out.is_empty() {
            let filename = match current_tid {
                Some(tid) => outpath.join(format!("{}.dat", tid)),
                None => outpath.to_path_buf(),
            };
            debug!(
                "  Writing to disk: {} events, {} bytes ({})",
                out.len() / 16,
                out.len(),
                filename.display()
            );
            fs::write(filename, &out)?;
        }
    }

    let unfinished: usize = open.values().map(Vec::len).sum();
    if unfinished > 0 {
        debug!("{} calls had not returned when the capture stopped", unfinished);
    }

    Ok(tids)
}

#[allow(clippy::identity_op)]
#[allow(clippy::erasing_op)]
fn write_event(
    out: &mut Vec<u8>,
    time: u64,
    addr: u64,
    depth: usize,
    kind: u64,
) -> std::io::Result<()> {
    out.write_u64::<LittleEndian>(time)?;

    let mut merged: u64 = 0;
    merged |= (kind & 0b11) << 0; // type = UFTRACE_EXIT / UFTRACE_ENTRY
    merged |= 0 << 2; // more, always 0
    merged |= 0b101 << 3; // magic, always 0b101
    merged |= (depth.min(MAX_DEPTH) as u64) << 6; // depth
    merged |= (addr & ((1 << 48) - 1)) << 16; // actual address, limited to 48 bit.
    out.write_u64::<LittleEndian>(merged)
}
