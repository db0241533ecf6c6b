//! x86_64 register layout and DR0-DR3/DR7 hardware debug register encoding.

use crate::error::{EngineError, EngineResult};
use nix::sys::ptrace;
use nix::unistd::Pid;

pub const HW_BP_SLOTS: usize = 4;
pub const TRAP_INSN: &[u8] = &[0xCC];
pub const TRAP_INSN_LEN: usize = 1;

/// x86_64's `int3` retires before trapping, so the reported PC is one byte
/// past the breakpoint address; the dispatcher rewinds by this much.
pub const SW_BP_PC_ADJUST: u64 = TRAP_INSN_LEN as u64;

/// x86_64 has exactly 4 physical debug address registers (DR0-DR3) shared
/// between execute breakpoints and data watchpoints — unlike aarch64, which
/// has independent BCR/BVR and WCR/WVR register files. So on this
/// architecture the watchpoint table's slots are carved out of the tail of
/// the same 4-register file rather than existing independently; see
/// `DESIGN.md` for why.
pub fn breakpoint_capacity(watchpoint_slots: usize) -> usize {
    HW_BP_SLOTS.saturating_sub(watchpoint_slots)
}

pub fn watchpoint_physical_index(logical_index: usize, watchpoint_slots: usize) -> usize {
    breakpoint_capacity(watchpoint_slots) + logical_index
}

lazy_static::lazy_static! {
    /// Offset of `user.u_debugreg` within `struct user`, used for
    /// PTRACE_PEEKUSER/POKEUSER addressing of DR0-DR7.
    static ref DEBUG_REG_OFFSET: usize = unsafe {
        let x = std::mem::zeroed::<libc::user>();
        (&x.u_debugreg as *const _ as usize) - (&x as *const _ as usize)
    };
}

/// A snapshot of the general-purpose registers for one thread, taken at
/// stop time. Field names match the architecture-specific register name
/// strings accepted by `Engine::read_register`/`write_register`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(non_snake_case)]
pub struct GpRegs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub ss: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

impl From<libc::user_regs_struct> for GpRegs {
    fn from(r: libc::user_regs_struct) -> Self {
        GpRegs {
            rax: r.rax,
            rbx: r.rbx,
            rcx: r.rcx,
            rdx: r.rdx,
            rsi: r.rsi,
            rdi: r.rdi,
            rbp: r.rbp,
            rsp: r.rsp,
            r8: r.r8,
            r9: r.r9,
            r10: r.r10,
            r11: r.r11,
            r12: r.r12,
            r13: r.r13,
            r14: r.r14,
            r15: r.r15,
            rip: r.rip,
            rflags: r.eflags,
            cs: r.cs,
            ss: r.ss,
            ds: r.ds,
            es: r.es,
            fs: r.fs,
            gs: r.gs,
        }
    }
}

impl GpRegs {
    fn apply_to(&self, r: &mut libc::user_regs_struct) {
        r.rax = self.rax;
        r.rbx = self.rbx;
        r.rcx = self.rcx;
        r.rdx = self.rdx;
        r.rsi = self.rsi;
        r.rdi = self.rdi;
        r.rbp = self.rbp;
        r.rsp = self.rsp;
        r.r8 = self.r8;
        r.r9 = self.r9;
        r.r10 = self.r10;
        r.r11 = self.r11;
        r.r12 = self.r12;
        r.r13 = self.r13;
        r.r14 = self.r14;
        r.r15 = self.r15;
        r.rip = self.rip;
        r.eflags = self.rflags;
        r.cs = self.cs;
        r.ss = self.ss;
        r.ds = self.ds;
        r.es = self.es;
        r.fs = self.fs;
        r.gs = self.gs;
    }

    pub fn pc(&self) -> u64 {
        self.rip
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.rip = pc;
    }

    pub fn read_named(&self, name: &str) -> EngineResult<u64> {
        Ok(match name {
            "rax" => self.rax,
            "rbx" => self.rbx,
            "rcx" => self.rcx,
            "rdx" => self.rdx,
            "rsi" => self.rsi,
            "rdi" => self.rdi,
            "rbp" => self.rbp,
            "rsp" => self.rsp,
            "r8" => self.r8,
            "r9" => self.r9,
            "r10" => self.r10,
            "r11" => self.r11,
            "r12" => self.r12,
            "r13" => self.r13,
            "r14" => self.r14,
            "r15" => self.r15,
            "rip" => self.rip,
            "rflags" => self.rflags,
            "cs" => self.cs,
            "ss" => self.ss,
            "ds" => self.ds,
            "es" => self.es,
            "fs" => self.fs,
            "gs" => self.gs,
            other => return Err(EngineError::UnknownRegister(other.to_string())),
        })
    }

    pub fn write_named(&mut self, name: &str, value: u64) -> EngineResult<()> {
        match name {
            "rax" => self.rax = value,
            "rbx" => self.rbx = value,
            "rcx" => self.rcx = value,
            "rdx" => self.rdx = value,
            "rsi" => self.rsi = value,
            "rdi" => self.rdi = value,
            "rbp" => self.rbp = value,
            "rsp" => self.rsp = value,
            "r8" => self.r8 = value,
            "r9" => self.r9 = value,
            "r10" => self.r10 = value,
            "r11" => self.r11 = value,
            "r12" => self.r12 = value,
            "r13" => self.r13 = value,
            "r14" => self.r14 = value,
            "r15" => self.r15 = value,
            "rip" => self.rip = value,
            "rflags" => self.rflags = value,
            "cs" => self.cs = value,
            "ss" => self.ss = value,
            "ds" => self.ds = value,
            "es" => self.es = value,
            "fs" => self.fs = value,
            "gs" => self.gs = value,
            other => return Err(EngineError::UnknownRegister(other.to_string())),
        }
        Ok(())
    }
}

pub fn get_gp_regs(pid: Pid) -> EngineResult<GpRegs> {
    Ok(ptrace::getregs(pid)?.into())
}

pub fn set_gp_regs(pid: Pid, regs: &GpRegs) -> EngineResult<()> {
    let mut raw = ptrace::getregs(pid)?;
    regs.apply_to(&mut raw);
    ptrace::setregs(pid, raw)?;
    Ok(())
}

// PTRACE_PEEKUSER/POKEUSER have no safe wrapper in `nix` for arbitrary
// `struct user` offsets (only whole-register-set accessors are exposed), so
// DR0-DR7 access goes through raw libc::ptrace, same as the teacher's
// `ptrace_peekuser` workaround in `src/target/linux.rs`.
fn peekuser(pid: Pid, offset: usize) -> EngineResult<i64> {
    unsafe {
        *libc::__errno_location() = 0;
        let ret = libc::ptrace(
            libc::PTRACE_PEEKUSER,
            pid.as_raw(),
            offset as *mut libc::c_void,
            std::ptr::null_mut::<libc::c_void>(),
        );
        if ret == -1 && *libc::__errno_location() != 0 {
            return Err(EngineError::Nix(nix::Error::last()));
        }
        Ok(ret)
    }
}

fn pokeuser(pid: Pid, offset: usize, value: i64) -> EngineResult<()> {
    unsafe {
        let ret = libc::ptrace(
            libc::PTRACE_POKEUSER,
            pid.as_raw(),
            offset as *mut libc::c_void,
            value as *mut libc::c_void,
        );
        if ret == -1 {
            return Err(EngineError::Nix(nix::Error::last()));
        }
    }
    Ok(())
}

fn dr_offset(index: usize) -> usize {
    *DEBUG_REG_OFFSET + index * 8
}

/// Size encoding for the DR7 `LENn` field: 1 byte -> 00, 2 -> 01, 8 -> 10, 4 -> 11.
fn size_bits(size: u8) -> u64 {
    match size {
        1 => 0b00,
        2 => 0b01,
        8 => 0b10,
        4 => 0b11,
        _ => 0b00,
    }
}

/// Condition encoding for the DR7 `R/Wn` field: 00 execute, 01 write, 11 read-or-write.
fn rw_bits(kind: crate::watchpoint::WatchpointKind) -> u64 {
    use crate::watchpoint::WatchpointKind::*;
    match kind {
        Execute => 0b00,
        Write => 0b01,
        ReadWrite => 0b11,
    }
}

fn read_dr7(pid: Pid) -> EngineResult<u64> {
    Ok(peekuser(pid, dr_offset(7))? as u64)
}

fn write_dr7(pid: Pid, value: u64) -> EngineResult<()> {
    pokeuser(pid, dr_offset(7), value as i64)
}

fn clear_dr6_bit(pid: Pid, slot: usize) -> EngineResult<()> {
    let dr6 = peekuser(pid, dr_offset(6))? as u64;
    pokeuser(pid, dr_offset(6), (dr6 & !(1u64 << slot)) as i64)
}

/// Programs DR{slot} with `addr` and enables it in DR7 as an execute
/// breakpoint (length field unused for execute, kept at 00 per the manual).
pub fn install_hw_breakpoint(pid: Pid, slot: usize, addr: u64) -> EngineResult<()> {
    pokeuser(pid, dr_offset(slot), addr as i64)?;
    let mut dr7 = read_dr7(pid)?;
    let bit_mask = 0b11u64 << (16 + 4 * slot) | 0b11u64 << (2 * slot);
    dr7 &= !bit_mask;
    dr7 |= 1u64 << (2 * slot); // local enable
    write_dr7(pid, dr7)?;
    clear_dr6_bit(pid, slot)?;
    Ok(())
}

pub fn clear_hw_breakpoint(pid: Pid, slot: usize) -> EngineResult<()> {
    let mut dr7 = read_dr7(pid)?;
    dr7 &= !(0b11u64 << (16 + 4 * slot) | 0b11u64 << (2 * slot));
    write_dr7(pid, dr7)?;
    clear_dr6_bit(pid, slot)
}

/// Programs DR{slot} as a data watchpoint of the given size and access kind.
pub fn install_hw_watchpoint(
    pid: Pid,
    slot: usize,
    addr: u64,
    size: u8,
    kind: crate::watchpoint::WatchpointKind,
) -> EngineResult<()> {
    pokeuser(pid, dr_offset(slot), addr as i64)?;
    let mut dr7 = read_dr7(pid)?;
    dr7 &= !(0b11u64 << (16 + 4 * slot) | 0b11u64 << (2 * slot));
    dr7 |= 1u64 << (2 * slot);
    dr7 |= rw_bits(kind) << (16 + 4 * slot);
    dr7 |= size_bits(size) << (18 + 4 * slot);
    write_dr7(pid, dr7)?;
    clear_dr6_bit(pid, slot)?;
    Ok(())
}

pub fn clear_hw_watchpoint(pid: Pid, slot: usize) -> EngineResult<()> {
    clear_hw_breakpoint(pid, slot)
}

/// Returns the lowest-numbered DR6 slot that reports a hit, clearing its
/// status bit so the next stop doesn't see a stale hit.
pub fn hw_hit_slot(pid: Pid) -> EngineResult<Option<usize>> {
    let dr6 = peekuser(pid, dr_offset(6))? as u64;
    for i in 0..HW_BP_SLOTS {
        if dr6 & (1 << i) != 0 {
            clear_dr6_bit(pid, i)?;
            return Ok(Some(i));
        }
    }
    Ok(None)
}
