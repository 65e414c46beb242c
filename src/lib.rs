//! Human-readable call-stack traces from frame-pointer chains.
//!
//! A trace walks saved frame pointers from the caller outwards, resolves each
//! return address against a caller-supplied [`SymbolTable`], and renders every
//! frame as a line such as
//!
//! ```text
//! Function foo(int x=42, char *s="hello"), in
//! Function main(int argc=1, char **argv={"./prog"}), in
//! ```
//!
//! stopping at the configured root symbol. Every memory access goes through a
//! [`MemoryProbe`], so a corrupt stack yields an error (with the partial trace)
//! rather than a crash.

pub mod config;
pub mod dwarf;
pub mod error;
pub mod format;
pub mod frame;
pub mod maps;
pub mod memory;
pub mod output;
pub mod symbols;
pub mod walker;

use std::io;

pub use config::TraceConfig;
pub use error::{Error, FrameSlot, LoadError, ProbeError, Result, TraceError, WalkError};
pub use format::ArgumentFormatter;
pub use frame::{Frame, FrameDecoder, FramePointerDecoder, current_frame_base};
pub use memory::{LocalMemory, MemoryProbe, RemoteMemory, SnapshotMemory};
pub use output::TraceOutput;
pub use symbols::{ArgumentSymbol, FunctionSymbol, SymbolResolver, SymbolTable, TypeTag};
pub use walker::FrameWalker;

/// Writes the trace of the calling thread to `sink`.
///
/// The first line is the caller of `traceback`. The output is written once,
/// also when the walk fails part-way; the walk error is returned afterwards.
/// Requires code built with frame pointers.
#[inline(never)]
pub fn traceback<W: io::Write + ?Sized>(sink: &mut W, table: &SymbolTable, config: &TraceConfig) -> Result<()> {
    let frame_base = current_frame_base();
    let memory = LocalMemory::new();
    let walker = FrameWalker::new(&memory, FramePointerDecoder::native(), table, config);

    let (output, result) = match walker.walk(frame_base) {
        Ok(output) => (output, Ok(())),
        Err(WalkError { output, error }) => (output, Err(Error::Walk(error))),
    };
    output.write_to(sink)?;
    result
}
