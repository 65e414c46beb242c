use std::collections::HashSet;

use crate::config::TraceConfig;
use crate::error::{TraceError, WalkError};
use crate::format::ArgumentFormatter;
use crate::frame::FrameDecoder;
use crate::memory::MemoryProbe;
use crate::output::TraceOutput;
use crate::symbols::{SymbolResolver, SymbolTable};

/// Walks a frame-pointer chain from the innermost frame outwards, rendering
/// one line per frame until the root symbol is reached.
pub struct FrameWalker<'a, M: ?Sized, D> {
    memory: &'a M,
    decoder: D,
    table: &'a SymbolTable,
    config: &'a TraceConfig,
}

enum Step {
    Continue(u64),
    Root,
}

impl<'a, M: MemoryProbe + ?Sized, D: FrameDecoder> FrameWalker<'a, M, D> {
    pub fn new(memory: &'a M, decoder: D, table: &'a SymbolTable, config: &'a TraceConfig) -> Self {
        Self {
            memory,
            decoder,
            table,
            config,
        }
    }

    fn resolver(&self) -> SymbolResolver<'a> {
        SymbolResolver::new(self.table, self.config.max_function_size)
    }

    fn formatter(&self) -> ArgumentFormatter<'a, M> {
        ArgumentFormatter::new(self.memory, self.decoder.pointer_size(), self.config)
    }

    /// Walks from `initial_frame_base`, the frame of the code requesting the
    /// trace. That frame itself is not rendered: the first line is its caller.
    ///
    /// A return address found in frame `F` belongs to `F`'s caller, and that
    /// caller's arguments are read relative to the caller's own frame base,
    /// the saved frame pointer stored in `F`. [`ArgumentSymbol::offset`] is
    /// therefore measured from the frame base of the function it describes,
    /// never from the frame the return address was read from.
    ///
    /// On failure the error carries every line rendered so far.
    ///
    /// [`ArgumentSymbol::offset`]: crate::symbols::ArgumentSymbol::offset
    pub fn walk(&self, initial_frame_base: u64) -> Result<TraceOutput, WalkError> {
        let mut output = TraceOutput::new();
        match self.walk_into(&mut output, initial_frame_base) {
            Ok(()) => Ok(output),
            Err(error) => Err(WalkError { output, error }),
        }
    }

    /// Like [`walk`](Self::walk), but first renders the function executing at
    /// `pc` whose frame is `frame_base`, as captured from a register snapshot.
    /// That function's arguments are read relative to `frame_base`.
    pub fn walk_from(&self, pc: u64, frame_base: u64) -> Result<TraceOutput, WalkError> {
        let mut output = TraceOutput::new();
        match self.resolver().resolve(pc) {
            Some(function) if function.name == self.config.root_symbol => return Ok(output),
            Some(function) => output.push_frame(&self.formatter().format_function(function, frame_base)),
            None => output.push_frame(&unresolved_line(pc)),
        }
        match self.walk_into(&mut output, frame_base) {
            Ok(()) => Ok(output),
            Err(error) => Err(WalkError { output, error }),
        }
    }

    fn walk_into(&self, output: &mut TraceOutput, initial_frame_base: u64) -> Result<(), TraceError> {
        let resolver = self.resolver();
        let formatter = self.formatter();
        let mut visited = HashSet::new();
        let mut frame_base = initial_frame_base;

        loop {
            if visited.len() >= self.config.max_frames {
                log::warn!("giving up after {} frames", self.config.max_frames);
                return Err(TraceError::StackCorruption {
                    limit: self.config.max_frames,
                });
            }
            if !visited.insert(frame_base) {
                log::warn!("frame base {frame_base:#x} repeats, chain is cyclic");
                return Err(TraceError::CycleDetected { frame_base });
            }

            match self.step(&resolver, &formatter, output, frame_base)? {
                Step::Continue(next) => frame_base = next,
                Step::Root => return Ok(()),
            }
        }
    }

    fn step(
        &self,
        resolver: &SymbolResolver<'a>,
        formatter: &ArgumentFormatter<'a, M>,
        output: &mut TraceOutput,
        frame_base: u64,
    ) -> Result<Step, TraceError> {
        let frame = self.decoder.decode(self.memory, frame_base)?;
        log::debug!(
            "frame {frame_base:#x}: return address {:#x}, caller frame {:#x}",
            frame.return_address,
            frame.caller_frame_base
        );

        // The return address lies in the caller, whose arguments live in the
        // caller's frame.
        match resolver.resolve(frame.return_address) {
            None => {
                log::debug!("no symbol for {:#x}", frame.return_address);
                output.push_frame(&unresolved_line(frame.return_address));
            }
            Some(function) if function.name == self.config.root_symbol => {
                log::debug!("reached root symbol {}", function.name);
                return Ok(Step::Root);
            }
            Some(function) => {
                output.push_frame(&formatter.format_function(function, frame.caller_frame_base));
            }
        }

        Ok(Step::Continue(frame.caller_frame_base))
    }
}

fn unresolved_line(address: u64) -> String {
    format!("Function {address:#x}(...), in\n")
}
