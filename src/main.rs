use std::fs;
use std::io::{self, Write};
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;
use nix::sys::ptrace;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;

use traceback::config::{DEFAULT_MAX_FRAMES, DEFAULT_MAX_FUNCTION_SIZE};
use traceback::{
    FramePointerDecoder, FrameWalker, RemoteMemory, SymbolTable, TraceConfig, TraceOutput, WalkError, dwarf, maps,
};

// Compile-time architecture verification
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("The traceback tool currently supports only x86_64 and aarch64 architectures");

#[derive(Debug, Parser)]
#[command(name = "traceback", version, about = "Print argument-annotated stack traces of every thread of a process")]
struct Args {
    /// Process to trace
    pid: i32,

    /// Function at which unwinding stops; it is not printed
    #[arg(long, default_value = "main")]
    root: String,

    /// Frames walked per thread before the stack is declared corrupt
    #[arg(long, default_value_t = DEFAULT_MAX_FRAMES)]
    max_frames: usize,

    /// Largest plausible function body, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FUNCTION_SIZE)]
    max_function_size: u64,

    /// More diagnostics on stderr (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

struct ThreadTrace {
    tid: i32,
    thread_name: String,
    pc: u64,
    frame_base: u64,
    result: Result<TraceOutput, WalkError>,
}

// Architecture-agnostic register access: (program counter, frame pointer)
#[cfg(target_arch = "x86_64")]
fn frame_registers(pid: Pid) -> nix::Result<(u64, u64)> {
    let regs = ptrace::getregs(pid)?;
    Ok((regs.rip, regs.rbp))
}

#[cfg(target_arch = "aarch64")]
fn frame_registers(pid: Pid) -> nix::Result<(u64, u64)> {
    let regs = ptrace::getregs(pid)?;
    // X29 is the frame pointer in AAPCS64
    Ok((regs.pc, regs.regs[29]))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let pid = args.pid;
    let config = TraceConfig::default()
        .with_root_symbol(args.root)
        .with_max_frames(args.max_frames)
        .with_max_function_size(args.max_function_size);

    // Load symbols before stopping anything; the process only pauses for the walk.
    let executable_path = format!("/proc/{pid}/exe");
    let executable = fs::read(&executable_path).with_context(|| format!("failed to read {executable_path}"))?;
    let bias = maps::load_bias(pid, &executable).context("failed to locate the executable in memory")?;
    let table = dwarf::load_symbol_table(&executable, bias).context("failed to load debug information")?;
    let table = dwarf::with_root_from_symtab(table, &executable, bias, &config.root_symbol)?;
    log::info!("{} functions known, load bias {bias:#x}", table.len());

    let start_time = Instant::now();
    let thread_ids = discover_threads(pid)?;
    log::info!("found {} threads", thread_ids.len());

    let traces = trace_all_threads(pid, &thread_ids, &table, &config);
    log::info!("process was stopped for {:?}", start_time.elapsed());

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for (i, trace) in traces.iter().enumerate() {
        writeln!(
            out,
            "=== Thread {} (TID: {}, Name: '{}') pc=0x{:016x} fp=0x{:016x} ===",
            i + 1,
            trace.tid,
            trace.thread_name,
            trace.pc,
            trace.frame_base
        )?;
        match &trace.result {
            Ok(output) => output.write_to(&mut out)?,
            Err(err) => {
                err.output.write_to(&mut out)?;
                writeln!(out, "trace incomplete: {}", err.error)?;
            }
        }
    }

    Ok(())
}

fn discover_threads(pid: i32) -> anyhow::Result<Vec<i32>> {
    let task_dir = format!("/proc/{pid}/task");
    let mut thread_ids = Vec::new();

    for entry in fs::read_dir(&task_dir).with_context(|| format!("failed to list {task_dir}"))? {
        let entry = entry?;
        if let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() {
            thread_ids.push(tid);
        }
    }

    thread_ids.sort();
    Ok(thread_ids)
}

fn trace_all_threads(pid: i32, thread_ids: &[i32], table: &SymbolTable, config: &TraceConfig) -> Vec<ThreadTrace> {
    let mut attached_tids = Vec::new();

    // Attach to all threads first
    for &tid in thread_ids {
        match ptrace::attach(Pid::from_raw(tid)) {
            Ok(()) => match waitpid(Pid::from_raw(tid), None) {
                Ok(WaitStatus::Stopped(_, _)) => attached_tids.push(tid),
                Ok(status) => log::warn!("unexpected wait status for TID {tid}: {status:?}"),
                Err(e) => log::warn!("failed to wait for TID {tid}: {e}"),
            },
            Err(e) => log::warn!("failed to attach to TID {tid}: {e}"),
        }
    }

    // Walk every stopped thread
    let mut traces = Vec::new();
    for &tid in &attached_tids {
        match trace_thread(pid, tid, table, config) {
            Ok(trace) => traces.push(trace),
            Err(e) => log::warn!("failed to read registers of TID {tid}: {e}"),
        }
    }

    // Detach from all threads to resume the process
    for &tid in &attached_tids {
        if let Err(e) = ptrace::detach(Pid::from_raw(tid), None) {
            log::warn!("failed to detach from TID {tid}: {e}");
        }
    }

    traces
}

fn get_thread_name(pid: i32, tid: i32) -> String {
    let comm_path = format!("/proc/{pid}/task/{tid}/comm");
    match fs::read_to_string(&comm_path) {
        Ok(name) => name.trim().to_string(),
        Err(_) => "<unknown>".to_string(),
    }
}

fn trace_thread(pid: i32, tid: i32, table: &SymbolTable, config: &TraceConfig) -> nix::Result<ThreadTrace> {
    let thread_name = get_thread_name(pid, tid);
    let (pc, frame_base) = frame_registers(Pid::from_raw(tid))?;

    let memory = RemoteMemory::new(tid);
    let walker = FrameWalker::new(&memory, FramePointerDecoder::native(), table, config);
    let result = walker.walk_from(pc, frame_base);
    if let Err(err) = &result {
        log::warn!("TID {tid}: {}", err.error);
    }

    Ok(ThreadTrace {
        tid,
        thread_name,
        pc,
        frame_base,
        result,
    })
}
