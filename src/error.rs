use std::fmt;
use std::io;

use crate::output::TraceOutput;

/// A read the safety probe refused. Always recoverable by the caller.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("reading {len} bytes at {address:#x} faulted: {source}")]
    Fault {
        address: u64,
        len: usize,
        #[source]
        source: nix::Error,
    },

    #[error("short read at {address:#x}: wanted {expected} bytes, got {actual}")]
    ShortRead {
        address: u64,
        expected: usize,
        actual: usize,
    },

    #[error("{len} bytes at {address:#x} are outside every captured region")]
    Unmapped { address: u64, len: usize },

    #[error("address {base:#x} + {offset} overflows")]
    AddressOverflow { base: u64, offset: i64 },
}

/// Which linkage slot of a frame could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSlot {
    SavedFrameBase,
    ReturnAddress,
}

impl fmt::Display for FrameSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameSlot::SavedFrameBase => f.write_str("saved frame base"),
            FrameSlot::ReturnAddress => f.write_str("return address"),
        }
    }
}

/// Fatal walk failures.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("corrupt frame at {frame_base:#x}: {slot} slot at {address:#x} is unreadable")]
    CorruptFrame {
        frame_base: u64,
        slot: FrameSlot,
        address: u64,
    },

    #[error("stack corruption: walked {limit} frames without reaching the root symbol")]
    StackCorruption { limit: usize },

    #[error("stack corruption: frame base {frame_base:#x} visited twice")]
    CycleDetected { frame_base: u64 },
}

/// A walk that stopped early, carrying everything rendered before the failure.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct WalkError {
    pub output: TraceOutput,
    #[source]
    pub error: TraceError,
}

/// Failures while building a symbol table from an executable.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse object file: {0}")]
    Object(#[from] object::Error),

    #[error("failed to read DWARF: {0}")]
    Dwarf(#[from] gimli::Error),

    #[error("no mapping of {executable} found in {maps}")]
    Maps { executable: String, maps: String },
}

/// Error returned by [`crate::traceback`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Walk(#[from] TraceError),

    #[error("failed to write trace: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
