//! Safe access to memory that may not be mapped.
//!
//! Every read the walker and the formatter perform goes through a
//! [`MemoryProbe`]. A probe never dereferences an address directly: the kernel
//! (or a captured snapshot) decides whether the bytes exist, and an unreadable
//! address comes back as a [`ProbeError`] instead of a fault in this process.

use std::cell::{Cell, OnceCell};
use std::collections::BTreeMap;
use std::io::IoSliceMut;
use std::os::fd::{AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc::{c_long, c_void};
use nix::sys::ptrace;
use nix::sys::uio::{RemoteIoVec, process_vm_readv};
use nix::unistd::Pid;

use crate::error::ProbeError;

/// Largest single write pushed through the fallback pipe; stays well under
/// `PIPE_BUF` so the pipe never fills.
const PIPE_CHUNK: usize = 512;

pub trait MemoryProbe {
    /// Fills `buf` from `address`, or fails without touching the process.
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), ProbeError>;

    fn can_read(&self, address: u64) -> bool {
        let mut byte = [0u8; 1];
        self.read_bytes(address, &mut byte).is_ok()
    }

    fn read_u8(&self, address: u64) -> Result<u8, ProbeError> {
        let mut buf = [0u8; 1];
        self.read_bytes(address, &mut buf)?;
        Ok(buf[0])
    }

    fn read_i32(&self, address: u64) -> Result<i32, ProbeError> {
        let mut buf = [0u8; 4];
        self.read_bytes(address, &mut buf)?;
        Ok(i32::from_ne_bytes(buf))
    }

    fn read_f32(&self, address: u64) -> Result<f32, ProbeError> {
        let mut buf = [0u8; 4];
        self.read_bytes(address, &mut buf)?;
        Ok(f32::from_ne_bytes(buf))
    }

    fn read_f64(&self, address: u64) -> Result<f64, ProbeError> {
        let mut buf = [0u8; 8];
        self.read_bytes(address, &mut buf)?;
        Ok(f64::from_ne_bytes(buf))
    }

    /// Reads a pointer-sized word; `size` is 4 or 8.
    fn read_word(&self, address: u64, size: usize) -> Result<u64, ProbeError> {
        if size == 4 {
            let mut buf = [0u8; 4];
            self.read_bytes(address, &mut buf)?;
            Ok(u64::from(u32::from_ne_bytes(buf)))
        } else {
            let mut buf = [0u8; 8];
            self.read_bytes(address, &mut buf)?;
            Ok(u64::from_ne_bytes(buf))
        }
    }
}

impl<M: MemoryProbe + ?Sized> MemoryProbe for &M {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), ProbeError> {
        (**self).read_bytes(address, buf)
    }
}

/// `base + offset`, refusing to wrap around the address space.
pub fn offset_address(base: u64, offset: i64) -> Result<u64, ProbeError> {
    base.checked_add_signed(offset)
        .ok_or(ProbeError::AddressOverflow { base, offset })
}

enum Style {
    /// `process_vm_readv` on our own pid.
    VirtualMem,
    /// Writes the bytes into a pipe and reads them back; the kernel reports
    /// `EFAULT` for unreadable sources. Used where `process_vm_readv` is
    /// filtered out (seccomp, old kernels).
    Pipe { read: OwnedFd, write: OwnedFd },
    Unavailable(Errno),
}

/// Probes the calling process's own address space.
///
/// Not `Sync`: each trace builds its own.
pub struct LocalMemory {
    pid: Pid,
    style: OnceCell<Style>,
}

impl std::fmt::Debug for LocalMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let style = match self.style.get() {
            Some(Style::VirtualMem) => "process_vm_readv",
            Some(Style::Pipe { .. }) => "pipe",
            Some(Style::Unavailable(_)) => "unavailable",
            None => "unknown",
        };
        f.debug_struct("LocalMemory")
            .field("pid", &self.pid)
            .field("style", &style)
            .finish()
    }
}

impl Default for LocalMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalMemory {
    pub fn new() -> Self {
        Self {
            pid: Pid::this(),
            style: OnceCell::new(),
        }
    }

    fn style(&self) -> &Style {
        self.style.get_or_init(|| Self::detect(self.pid))
    }

    fn detect(pid: Pid) -> Style {
        let canary = 0u64;
        let mut buf = [0u8; 8];
        let address = &canary as *const u64 as usize as u64;
        match virtual_mem(pid, address, &mut buf) {
            Ok(()) => return Style::VirtualMem,
            Err(err) => log::trace!("process_vm_readv unusable on self ({err}), falling back to a pipe"),
        }

        match nix::unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK) {
            Ok((read, write)) => Style::Pipe { read, write },
            Err(err) => {
                log::warn!("no memory probe available: {err}");
                Style::Unavailable(err)
            }
        }
    }
}

impl MemoryProbe for LocalMemory {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), ProbeError> {
        if buf.is_empty() {
            return Ok(());
        }
        match self.style() {
            Style::VirtualMem => virtual_mem(self.pid, address, buf),
            Style::Pipe { read, write } => through_pipe(read, write, address, buf),
            Style::Unavailable(source) => Err(ProbeError::Fault {
                address,
                len: buf.len(),
                source: *source,
            }),
        }
    }
}

/// Probes another process, typically one stopped under ptrace.
#[derive(Debug)]
pub struct RemoteMemory {
    pid: Pid,
    use_ptrace: Cell<bool>,
}

impl RemoteMemory {
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
            use_ptrace: Cell::new(false),
        }
    }
}

impl MemoryProbe for RemoteMemory {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), ProbeError> {
        if buf.is_empty() {
            return Ok(());
        }
        if !self.use_ptrace.get() {
            match virtual_mem(self.pid, address, buf) {
                Err(ProbeError::Fault { source, .. })
                    if source == Errno::ENOSYS || source == Errno::EPERM =>
                {
                    log::debug!("process_vm_readv on {} failed ({source}), using PTRACE_PEEKDATA", self.pid);
                    self.use_ptrace.set(true);
                }
                result => return result,
            }
        }
        peek_data(self.pid, address, buf)
    }
}

/// Byte regions captured ahead of time, e.g. a copied stack.
///
/// Reads must fall entirely inside one region.
#[derive(Debug, Clone, Default)]
pub struct SnapshotMemory {
    regions: BTreeMap<u64, Vec<u8>>,
}

impl SnapshotMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, base: u64, bytes: impl Into<Vec<u8>>) -> &mut Self {
        self.regions.insert(base, bytes.into());
        self
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }
}

impl MemoryProbe for SnapshotMemory {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), ProbeError> {
        let len = buf.len();
        let unmapped = || ProbeError::Unmapped { address, len };
        let Some((&base, bytes)) = self.regions.range(..=address).next_back() else {
            return Err(unmapped());
        };
        let start = usize::try_from(address - base).map_err(|_| unmapped())?;
        let Some(src) = start
            .checked_add(len)
            .and_then(|end| bytes.get(start..end))
        else {
            return Err(unmapped());
        };
        buf.copy_from_slice(src);
        Ok(())
    }
}

fn virtual_mem(pid: Pid, address: u64, buf: &mut [u8]) -> Result<(), ProbeError> {
    let expected = buf.len();
    let remote = [RemoteIoVec {
        base: address as usize,
        len: expected,
    }];
    let read = process_vm_readv(pid, &mut [IoSliceMut::new(buf)], &remote).map_err(|source| {
        ProbeError::Fault {
            address,
            len: expected,
            source,
        }
    })?;
    if read < expected {
        return Err(ProbeError::ShortRead {
            address,
            expected,
            actual: read,
        });
    }
    Ok(())
}

fn through_pipe(read: &OwnedFd, write: &OwnedFd, address: u64, buf: &mut [u8]) -> Result<(), ProbeError> {
    let mut src = address;
    for chunk in buf.chunks_mut(PIPE_CHUNK) {
        // SAFETY: `src` is never dereferenced here; the kernel copies from it
        // and reports EFAULT if any byte is unmapped.
        let written = Errno::result(unsafe {
            nix::libc::write(write.as_raw_fd(), src as usize as *const c_void, chunk.len())
        })
        .map_err(|source| ProbeError::Fault {
            address: src,
            len: chunk.len(),
            source,
        })? as usize;

        // Drain what was written so the pipe is empty for the next probe.
        // SAFETY: `chunk` is a live, writable buffer of at least `written` bytes.
        let drained = Errno::result(unsafe {
            nix::libc::read(read.as_raw_fd(), chunk.as_mut_ptr().cast::<c_void>(), written)
        })
        .map_err(|source| ProbeError::Fault {
            address: src,
            len: chunk.len(),
            source,
        })? as usize;

        if written < chunk.len() || drained < written {
            return Err(ProbeError::ShortRead {
                address: src,
                expected: chunk.len(),
                actual: written.min(drained),
            });
        }
        src += chunk.len() as u64;
    }
    Ok(())
}

fn peek_data(pid: Pid, address: u64, buf: &mut [u8]) -> Result<(), ProbeError> {
    let word_size = std::mem::size_of::<c_long>();
    let mut offset = 0;
    while offset < buf.len() {
        let src = address + offset as u64;
        let word = ptrace::read(pid, src as *mut c_void).map_err(|source| ProbeError::Fault {
            address: src,
            len: word_size,
            source,
        })?;
        let bytes = word.to_ne_bytes();
        let take = (buf.len() - offset).min(word_size);
        buf[offset..offset + take].copy_from_slice(&bytes[..take]);
        offset += take;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reads_inside_a_region() {
        let mut memory = SnapshotMemory::new();
        memory.insert(0x1000, 0xdead_beef_u64.to_ne_bytes().to_vec());
        memory.insert(0x2000, 0x1234_u32.to_ne_bytes().to_vec());

        assert_eq!(memory.read_word(0x1000, 8).unwrap(), 0xdead_beef);
        assert_eq!(memory.read_word(0x2000, 4).unwrap(), 0x1234);
        assert!(memory.can_read(0x1007));
        assert_eq!(memory.region_count(), 2);
    }

    #[test]
    fn snapshot_refuses_reads_past_a_region() {
        let mut memory = SnapshotMemory::new();
        memory.insert(0x1000, vec![1, 2, 3, 4]);

        assert!(!memory.can_read(0x0fff));
        assert!(!memory.can_read(0x1004));
        assert!(memory.read_i32(0x1001).is_err());
        assert!(memory.read_i32(0x1000).is_ok());
    }

    #[test]
    fn offset_address_rejects_wraparound() {
        assert_eq!(offset_address(0x1000, -8).unwrap(), 0xff8);
        assert!(offset_address(4, -8).is_err());
        assert!(offset_address(u64::MAX, 1).is_err());
    }

    #[test]
    fn local_memory_reads_own_stack() {
        let value: u64 = 0x0123_4567_89ab_cdef;
        let memory = LocalMemory::new();
        let address = &value as *const u64 as usize as u64;

        assert_eq!(memory.read_word(address, 8).unwrap(), value);
    }

    #[test]
    fn local_memory_reports_unmapped_page() {
        let memory = LocalMemory::new();

        assert!(!memory.can_read(0x10));
        assert!(memory.read_word(0x10, 8).is_err());
    }

    fn pipe_memory() -> LocalMemory {
        let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).unwrap();
        LocalMemory {
            pid: Pid::this(),
            style: OnceCell::from(Style::Pipe { read, write }),
        }
    }

    /// Two anonymous pages with the second unmapped again, so the first ends
    /// at a hole.
    struct GuardedPage {
        base: *mut c_void,
        size: usize,
    }

    impl GuardedPage {
        fn new() -> Self {
            // SAFETY: plain anonymous mappings, released in `drop`.
            unsafe {
                let size = nix::libc::sysconf(nix::libc::_SC_PAGESIZE) as usize;
                let base = nix::libc::mmap(
                    std::ptr::null_mut(),
                    size * 2,
                    nix::libc::PROT_READ | nix::libc::PROT_WRITE,
                    nix::libc::MAP_PRIVATE | nix::libc::MAP_ANONYMOUS,
                    -1,
                    0,
                );
                assert_ne!(base, nix::libc::MAP_FAILED);
                assert_eq!(nix::libc::munmap(base.cast::<u8>().add(size).cast(), size), 0);
                Self { base, size }
            }
        }

        fn end(&self) -> u64 {
            self.base as usize as u64 + self.size as u64
        }
    }

    impl Drop for GuardedPage {
        fn drop(&mut self) {
            // SAFETY: `base` maps exactly `size` bytes.
            unsafe {
                nix::libc::munmap(self.base, self.size);
            }
        }
    }

    #[test]
    fn pipe_style_reads_mapped_memory() {
        let value: u64 = 0x1122_3344_5566_7788;
        let memory = pipe_memory();

        assert_eq!(memory.read_word(&value as *const u64 as usize as u64, 8).unwrap(), value);
    }

    #[test]
    fn pipe_style_is_drained_after_a_fault() {
        let value: u64 = 7;
        let memory = pipe_memory();

        assert!(matches!(
            memory.read_word(0x10, 8),
            Err(ProbeError::Fault { address: 0x10, source: Errno::EFAULT, .. })
        ));
        assert_eq!(memory.read_word(&value as *const u64 as usize as u64, 8).unwrap(), 7);
    }

    #[test]
    fn pipe_style_refuses_reads_across_into_a_hole() {
        let page = GuardedPage::new();
        let memory = pipe_memory();
        let value: u64 = 0xabcd;

        assert!(memory.read_i32(page.end() - 4).is_ok());
        assert!(memory.read_word(page.end() - 4, 8).is_err());
        assert!(!memory.can_read(page.end()));
        assert_eq!(memory.read_word(&value as *const u64 as usize as u64, 8).unwrap(), 0xabcd);
    }

    #[test]
    fn virtual_mem_refuses_reads_across_into_a_hole() {
        let page = GuardedPage::new();
        let memory = LocalMemory::new();

        assert!(memory.read_i32(page.end() - 4).is_ok());
        assert!(memory.read_word(page.end() - 4, 8).is_err());
    }

    #[test]
    fn pipe_style_reads_more_than_one_chunk() {
        let bytes: Vec<u8> = (0..PIPE_CHUNK * 3 + 17).map(|i| i as u8).collect();
        let memory = pipe_memory();
        let mut buf = vec![0u8; bytes.len()];

        memory.read_bytes(bytes.as_ptr() as usize as u64, &mut buf).unwrap();
        assert_eq!(buf, bytes);
    }

    #[test]
    fn remote_memory_reads_own_process() {
        let value: u64 = 0x5555_aaaa;
        let memory = RemoteMemory::new(std::process::id() as i32);

        assert_eq!(memory.read_word(&value as *const u64 as usize as u64, 8).unwrap(), value);
        assert!(!memory.use_ptrace.get());
        assert!(!memory.can_read(0x10));
    }

    /// A child stopped under ptrace, killed when dropped.
    struct TracedChild(std::process::Child);

    impl TracedChild {
        fn spawn() -> Self {
            let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
            let traced = Self(child);
            let pid = traced.pid();
            ptrace::attach(pid).unwrap();
            assert!(matches!(
                nix::sys::wait::waitpid(pid, None).unwrap(),
                nix::sys::wait::WaitStatus::Stopped(..)
            ));
            traced
        }

        fn pid(&self) -> Pid {
            Pid::from_raw(self.0.id() as i32)
        }
    }

    impl Drop for TracedChild {
        fn drop(&mut self) {
            let _ = self.0.kill();
            let _ = self.0.wait();
        }
    }

    #[test]
    fn peek_data_matches_process_vm_readv() {
        let child = TracedChild::spawn();
        let mappings = crate::maps::read_mappings(child.pid().as_raw()).unwrap();
        let readable = mappings
            .iter()
            .find(|mapping| mapping.permissions.starts_with('r'))
            .unwrap();

        let direct = RemoteMemory::new(child.pid().as_raw());
        let peeking = RemoteMemory::new(child.pid().as_raw());
        peeking.use_ptrace.set(true);

        let mut expected = [0u8; 13];
        let mut actual = [0u8; 13];
        direct.read_bytes(readable.start, &mut expected).unwrap();
        peeking.read_bytes(readable.start, &mut actual).unwrap();
        assert_eq!(actual, expected);

        assert!(matches!(peeking.read_word(0x10, 8), Err(ProbeError::Fault { address: 0x10, .. })));
    }
}
