use crate::error::{FrameSlot, TraceError};
use crate::memory::{MemoryProbe, offset_address};

/// Linkage read out of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub return_address: u64,
    pub caller_frame_base: u64,
}

/// Knows where a calling convention keeps the saved linkage of a frame.
pub trait FrameDecoder {
    /// Width of pointers and saved words, in bytes.
    fn pointer_size(&self) -> usize;

    fn decode<M: MemoryProbe + ?Sized>(&self, memory: &M, frame_base: u64) -> Result<Frame, TraceError>;
}

/// Conventional frame-pointer linkage: the caller's frame base and the return
/// address sit at fixed displacements from the frame base.
///
/// ```text
/// x86_64 / aarch64 / i386      riscv64
///   [fp + word]  return addr     [fp - 8]   return addr
///   [fp]         saved fp        [fp - 16]  saved fp
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePointerDecoder {
    pointer_size: usize,
    saved_frame_base_offset: i64,
    return_address_offset: i64,
}

impl FramePointerDecoder {
    pub const fn new(pointer_size: usize, saved_frame_base_offset: i64, return_address_offset: i64) -> Self {
        Self {
            pointer_size,
            saved_frame_base_offset,
            return_address_offset,
        }
    }

    pub const fn x86_64() -> Self {
        Self::new(8, 0, 8)
    }

    /// AAPCS64 frame record: `x29` points at `{x29, x30}`.
    pub const fn aarch64() -> Self {
        Self::new(8, 0, 8)
    }

    pub const fn i386() -> Self {
        Self::new(4, 0, 4)
    }

    pub const fn riscv64() -> Self {
        Self::new(8, -16, -8)
    }

    /// Decoder for the architecture this crate was built for.
    pub const fn native() -> Self {
        #[cfg(target_arch = "aarch64")]
        return Self::aarch64();
        #[cfg(target_arch = "x86")]
        return Self::i386();
        #[cfg(target_arch = "riscv64")]
        return Self::riscv64();
        #[cfg(not(any(target_arch = "aarch64", target_arch = "x86", target_arch = "riscv64")))]
        return Self::x86_64();
    }

    fn read_slot<M: MemoryProbe + ?Sized>(
        &self,
        memory: &M,
        frame_base: u64,
        offset: i64,
        slot: FrameSlot,
    ) -> Result<u64, TraceError> {
        let corrupt = |address| TraceError::CorruptFrame {
            frame_base,
            slot,
            address,
        };
        let address = offset_address(frame_base, offset).map_err(|_| corrupt(frame_base))?;
        memory
            .read_word(address, self.pointer_size)
            .map_err(|err| {
                log::debug!("{slot} slot of frame {frame_base:#x} unreadable: {err}");
                corrupt(address)
            })
    }
}

impl Default for FramePointerDecoder {
    fn default() -> Self {
        Self::native()
    }
}

impl FrameDecoder for FramePointerDecoder {
    fn pointer_size(&self) -> usize {
        self.pointer_size
    }

    fn decode<M: MemoryProbe + ?Sized>(&self, memory: &M, frame_base: u64) -> Result<Frame, TraceError> {
        let return_address = self.read_slot(memory, frame_base, self.return_address_offset, FrameSlot::ReturnAddress)?;
        let caller_frame_base =
            self.read_slot(memory, frame_base, self.saved_frame_base_offset, FrameSlot::SavedFrameBase)?;
        Ok(Frame {
            return_address,
            caller_frame_base,
        })
    }
}

/// Frame base of the function this is inlined into.
///
/// Meaningful only when that function keeps a frame pointer
/// (`-C force-frame-pointers=yes`).
#[inline(always)]
pub fn current_frame_base() -> u64 {
    let fp: usize;
    // SAFETY: copies a register; touches neither memory nor the stack.
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) fp, options(nomem, nostack, preserves_flags));
    }
    // SAFETY: as above.
    #[cfg(target_arch = "x86")]
    unsafe {
        core::arch::asm!("mov {}, ebp", out(reg) fp, options(nomem, nostack, preserves_flags));
    }
    // SAFETY: as above.
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("mov {}, x29", out(reg) fp, options(nomem, nostack, preserves_flags));
    }
    // SAFETY: as above.
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!("mv {}, fp", out(reg) fp, options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(any(
        target_arch = "x86_64",
        target_arch = "x86",
        target_arch = "aarch64",
        target_arch = "riscv64"
    )))]
    {
        fp = 0;
    }
    fp as u64
}
