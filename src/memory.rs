//! Batched remote memory access, grounded in the teacher's `ReadMemory`/
//! `WriteMemory` split (`src/target/linux.rs` references `readmem`/
//! `writemem` submodules): a fast path through `process_vm_readv`/`writev`,
//! falling back to word-at-a-time `PTRACE_PEEKTEXT`/`POKETEXT` for pages
//! `process_vm_*` can't reach (e.g. a page mapped `PROT_NONE` but still
//! ptrace-readable), matching the teacher's page-straddling test case.

use crate::error::{EngineError, EngineResult};
use nix::sys::ptrace;
use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
use nix::unistd::Pid;
use std::io::{IoSlice, IoSliceMut};

const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Reads up to `size` bytes at `address`. A read that starts in mapped
/// memory but runs into an unmapped page returns the bytes read so far
/// (short read, §6); a read that can't even start returns `InvalidAddress`.
pub fn read_memory(pid: Pid, address: u64, size: usize) -> EngineResult<Vec<u8>> {
    if size == 0 {
        return Ok(Vec::new());
    }

    let mut out = vec![0u8; size];
    let local = [IoSliceMut::new(&mut out)];
    let remote = [RemoteIoVec {
        base: address as usize,
        len: size,
    }];
    match process_vm_readv(pid, &local, &remote) {
        Ok(n) if n == size => return Ok(out),
        Ok(n) => return Ok(out[..n].to_vec()),
        Err(_) => {}
    }

    // Fall back to word-at-a-time PEEKTEXT, stopping (short read) at the
    // first word that can't be read.
    let mut bytes = Vec::with_capacity(size);
    let mut addr = address;
    while bytes.len() < size {
        match ptrace::read(pid, addr as ptrace::AddressType) {
            Ok(word) => {
                let word_bytes = word.to_ne_bytes();
                let take = WORD_SIZE.min(size - bytes.len());
                bytes.extend_from_slice(&word_bytes[..take]);
                addr += WORD_SIZE as u64;
            }
            Err(_) => break,
        }
    }
    if bytes.is_empty() {
        return Err(EngineError::InvalidAddress(address));
    }
    Ok(bytes)
}

/// Writes `data` at `address`. Fails with `InvalidAddress` if the target
/// memory is entirely unwritable (unmapped, or mapped without write
/// permission and ptrace word-patching also fails).
pub fn write_memory(pid: Pid, address: u64, data: &[u8]) -> EngineResult<()> {
    if data.is_empty() {
        return Ok(());
    }

    let local = [IoSlice::new(data)];
    let remote = [RemoteIoVec {
        base: address as usize,
        len: data.len(),
    }];
    if let Ok(n) = process_vm_writev(pid, &local, &remote) {
        if n == data.len() {
            return Ok(());
        }
    }

    write_memory_via_ptrace(pid, address, data)
}

/// Word-at-a-time read-modify-write through PTRACE_PEEKTEXT/POKETEXT, used
/// when `process_vm_writev` can't reach the target page (same technique as
/// the software-breakpoint install path in `clingfei-cs110l`/`1kohei1`'s
/// `Inferior::write_byte`).
fn write_memory_via_ptrace(pid: Pid, address: u64, data: &[u8]) -> EngineResult<()> {
    let mut offset = 0usize;
    while offset < data.len() {
        let word_addr = align_down(address + offset as u64);
        let byte_offset = (address + offset as u64 - word_addr) as usize;
        let existing = ptrace::read(pid, word_addr as ptrace::AddressType)
            .map_err(|_| EngineError::InvalidAddress(address))? as u64;
        let mut word_bytes = existing.to_ne_bytes();
        let take = (WORD_SIZE - byte_offset).min(data.len() - offset);
        word_bytes[byte_offset..byte_offset + take].copy_from_slice(&data[offset..offset + take]);
        let new_word = u64::from_ne_bytes(word_bytes);
        ptrace::write(
            pid,
            word_addr as ptrace::AddressType,
            new_word as *mut std::ffi::c_void,
        )
        .map_err(|_| EngineError::InvalidAddress(address))?;
        offset += take;
    }
    Ok(())
}

fn align_down(addr: u64) -> u64 {
    addr & !((WORD_SIZE as u64) - 1)
}

/// One region from `/proc/<pid>/maps`.
#[derive(Debug, Clone)]
pub struct MemoryMap {
    pub address: (u64, u64),
    pub backing_file: Option<(std::path::PathBuf, u64)>,
    pub is_readable: bool,
    pub is_writable: bool,
    pub is_executable: bool,
    pub is_private: bool,
}

pub fn memory_maps(pid: i32) -> EngineResult<Vec<MemoryMap>> {
    let proc = procfs::process::Process::new(pid).map_err(|_| EngineError::NotAttached)?;
    let maps = proc.maps().map_err(|_| EngineError::NotAttached)?;
    Ok(maps
        .into_iter()
        .map(|m| {
            let mut perms = m.perms.chars();
            MemoryMap {
                address: m.address,
                backing_file: match m.pathname {
                    procfs::process::MMapPath::Path(p) => Some((p, m.offset)),
                    _ => None,
                },
                is_readable: perms.next() == Some('r'),
                is_writable: perms.next() == Some('w'),
                is_executable: perms.next() == Some('x'),
                is_private: perms.next() == Some('p'),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    fn reads_own_memory() {
        let value: u64 = 0xdeadbeefcafef00d;
        let bytes = read_memory(getpid(), &value as *const u64 as u64, 8).unwrap();
        assert_eq!(bytes, value.to_ne_bytes());
    }

    #[test]
    fn zero_size_read_is_empty() {
        assert!(read_memory(getpid(), 0x1000, 0).unwrap().is_empty());
    }

    #[test]
    fn invalid_address_fails() {
        let err = read_memory(getpid(), 0x1, 8).unwrap_err();
        assert!(matches!(err, EngineError::InvalidAddress(_)));
    }
}
