use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fntrace::config::DEFAULT_SOCKET_PATH;
use fntrace_frontend::{dump_full_uftrace, Collector};
use log::info;

#[derive(Parser)]
#[command(about = "Capture function entries and exits from an fntrace producer")]
struct Args {
    #[arg(long, default_value = DEFAULT_SOCKET_PATH, help = "Socket the producer connects to")]
    socket: PathBuf,

    #[arg(long, default_value = "uftrace.data", help = "Directory for the uftrace data")]
    out_dir: PathBuf,

    #[arg(long, default_value = "a.out", help = "Name of the traced binary, used for symbols")]
    binary_name: String,

    #[arg(long, default_value = "1000", help = "How long to capture, in milliseconds")]
    duration_ms: u64,

    #[arg(
        long,
        default_value = "10000",
        help = "How long to wait for the producer to send everything after stopping"
    )]
    timeout_ms: u64,
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    let collector = Collector::bind(&args.socket)
        .with_context(|| format!("Failed to listen on {}", args.socket.display()))?;
    info!("Waiting for a producer...");
    let mut session = collector.accept().context("Failed to accept producer")?;

    session.start_capture().context("Failed to start capture")?;
    info!("Capturing for {} ms", args.duration_ms);
    thread::sleep(Duration::from_millis(args.duration_ms));
    session.stop_capture().context("Failed to stop capture")?;

    let trace = session
        .collect_until_all_events_sent(Duration::from_millis(args.timeout_ms))
        .context("Failed to receive capture")?;
    session
        .capture_finished()
        .context("Failed to finish capture")?;

    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("Failed to create {}", args.out_dir.display()))?;
    let tids = dump_full_uftrace(&trace, &args.out_dir, &args.binary_name)
        .context("Failed to write trace")?;

    println!(
        "Wrote {} events of {} threads to {}",
        trace.events.len(),
        tids.len(),
        args.out_dir.display()
    );
    if trace.dropped_events > 0 {
        println!("{} events were dropped by the producer", trace.dropped_events);
    }
    Ok(())
}
