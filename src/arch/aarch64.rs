//! aarch64 register layout and HBPCR/HWDRR (BCR/BVR, WCR/WVR) hardware debug
//! register encoding, reached through PTRACE_GETREGSET/SETREGSET with
//! NT_ARM_HW_BREAK / NT_ARM_HW_WATCH, since `nix` only wraps the common
//! NT_PRSTATUS regset.

use crate::error::{EngineError, EngineResult};
use nix::unistd::Pid;

pub const HW_BP_SLOTS: usize = 4;
pub const TRAP_INSN: &[u8] = &[0x00, 0x00, 0x20, 0xd4]; // brk #0
pub const TRAP_INSN_LEN: usize = 4;

/// aarch64's `brk` leaves PC pointing AT the trapping instruction (no
/// auto-advance), so no rewind is needed before re-arming or reporting.
pub const SW_BP_PC_ADJUST: u64 = 0;

/// aarch64 has independent BCR/BVR (breakpoint) and WCR/WVR (watchpoint)
/// register files reached through separate NT_ARM_HW_BREAK/NT_ARM_HW_WATCH
/// regsets, so unlike x86_64 the two tables never compete for the same
/// physical slot.
pub fn breakpoint_capacity(_watchpoint_slots: usize) -> usize {
    HW_BP_SLOTS
}

pub fn watchpoint_physical_index(logical_index: usize, _watchpoint_slots: usize) -> usize {
    logical_index
}

const NT_ARM_HW_BREAK: libc::c_int = 0x402;
const NT_ARM_HW_WATCH: libc::c_int = 0x403;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(non_snake_case)]
pub struct GpRegs {
    pub x: [u64; 29], // x0..x28
    pub fp: u64,      // x29
    pub lr: u64,      // x30
    pub sp: u64,
    pub pc: u64,
    pub cpsr: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct UserRegsStruct {
    regs: [u64; 31],
    sp: u64,
    pc: u64,
    pstate: u64,
}

impl From<UserRegsStruct> for GpRegs {
    fn from(r: UserRegsStruct) -> Self {
        let mut x = [0u64; 29];
        x.copy_from_slice(&r.regs[0..29]);
        GpRegs {
            x,
            fp: r.regs[29],
            lr: r.regs[30],
            sp: r.sp,
            pc: r.pc,
            cpsr: r.pstate,
        }
    }
}

impl GpRegs {
    fn to_raw(self) -> UserRegsStruct {
        let mut regs = [0u64; 31];
        regs[0..29].copy_from_slice(&self.x);
        regs[29] = self.fp;
        regs[30] = self.lr;
        UserRegsStruct {
            regs,
            sp: self.sp,
            pc: self.pc,
            pstate: self.cpsr,
        }
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    pub fn read_named(&self, name: &str) -> EngineResult<u64> {
        if let Some(idx) = name
            .strip_prefix('x')
            .and_then(|n| n.parse::<usize>().ok())
        {
            if idx <= 28 {
                return Ok(self.x[idx]);
            }
        }
        Ok(match name {
            "fp" => self.fp,
            "lr" => self.lr,
            "sp" => self.sp,
            "pc" => self.pc,
            "cpsr" => self.cpsr,
            other => return Err(EngineError::UnknownRegister(other.to_string())),
        })
    }

    pub fn write_named(&mut self, name: &str, value: u64) -> EngineResult<()> {
        if let Some(idx) = name
            .strip_prefix('x')
            .and_then(|n| n.parse::<usize>().ok())
        {
            if idx <= 28 {
                self.x[idx] = value;
                return Ok(());
            }
        }
        match name {
            "fp" => self.fp = value,
            "lr" => self.lr = value,
            "sp" => self.sp = value,
            "pc" => self.pc = value,
            "cpsr" => self.cpsr = value,
            other => return Err(EngineError::UnknownRegister(other.to_string())),
        }
        Ok(())
    }
}

fn getregset<T: Copy>(pid: Pid, nt_type: libc::c_int) -> EngineResult<T> {
    unsafe {
        let mut buf = std::mem::zeroed::<T>();
        let mut iov = libc::iovec {
            iov_base: &mut buf as *mut T as *mut libc::c_void,
            iov_len: std::mem::size_of::<T>(),
        };
        let ret = libc::ptrace(
            libc::PTRACE_GETREGSET,
            pid.as_raw(),
            nt_type as *mut libc::c_void,
            &mut iov as *mut _ as *mut libc::c_void,
        );
        if ret == -1 {
            return Err(EngineError::Nix(nix::Error::last()));
        }
        Ok(buf)
    }
}

fn setregset<T: Copy>(pid: Pid, nt_type: libc::c_int, value: &T) -> EngineResult<()> {
    unsafe {
        let mut value = *value;
        let mut iov = libc::iovec {
            iov_base: &mut value as *mut T as *mut libc::c_void,
            iov_len: std::mem::size_of::<T>(),
        };
        let ret = libc::ptrace(
            libc::PTRACE_SETREGSET,
            pid.as_raw(),
            nt_type as *mut libc::c_void,
            &mut iov as *mut _ as *mut libc::c_void,
        );
        if ret == -1 {
            return Err(EngineError::Nix(nix::Error::last()));
        }
    }
    Ok(())
}

pub fn get_gp_regs(pid: Pid) -> EngineResult<GpRegs> {
    Ok(getregset::<UserRegsStruct>(pid, libc::NT_PRSTATUS)?.into())
}

pub fn set_gp_regs(pid: Pid, regs: &GpRegs) -> EngineResult<()> {
    setregset(pid, libc::NT_PRSTATUS, &regs.to_raw())
}

/// Mirrors the kernel's `struct user_hwdebug_state` for one NT_ARM_HW_BREAK
/// or NT_ARM_HW_WATCH regset: an info word followed by up to 16 {addr, ctrl}
/// pairs (we only ever use the first 4, matching `HW_BP_SLOTS`).
#[repr(C)]
#[derive(Clone, Copy)]
struct HwDebugState {
    dbg_info: u32,
    pad: u32,
    dbg_regs: [HwDebugReg; 16],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct HwDebugReg {
    addr: u64,
    ctrl: u32,
    pad: u32,
}

impl Default for HwDebugState {
    fn default() -> Self {
        HwDebugState {
            dbg_info: 0,
            pad: 0,
            dbg_regs: [HwDebugReg::default(); 16],
        }
    }
}

fn size_bas(size: u8) -> u32 {
    // Byte Address Select: one bit per covered byte, assumes natural alignment.
    match size {
        1 => 0b0000_0001,
        2 => 0b0000_0011,
        4 => 0b0000_1111,
        8 => 0b1111_1111,
        _ => 0b0000_1111,
    }
}

fn lsc_bits(kind: crate::watchpoint::WatchpointKind) -> u32 {
    use crate::watchpoint::WatchpointKind::*;
    match kind {
        Execute => 0b00, // unused for BCR
        Write => 0b10,
        ReadWrite => 0b11,
    }
}

pub fn install_hw_breakpoint(pid: Pid, slot: usize, addr: u64) -> EngineResult<()> {
    let mut state: HwDebugState = getregset(pid, NT_ARM_HW_BREAK)?;
    state.dbg_regs[slot] = HwDebugReg {
        addr,
        ctrl: 1 | (0b10 << 1), // enable, EL0-only privilege
        pad: 0,
    };
    setregset(pid, NT_ARM_HW_BREAK, &state)
}

pub fn clear_hw_breakpoint(pid: Pid, slot: usize) -> EngineResult<()> {
    let mut state: HwDebugState = getregset(pid, NT_ARM_HW_BREAK)?;
    state.dbg_regs[slot] = HwDebugReg::default();
    setregset(pid, NT_ARM_HW_BREAK, &state)
}

pub fn install_hw_watchpoint(
    pid: Pid,
    slot: usize,
    addr: u64,
    size: u8,
    kind: crate::watchpoint::WatchpointKind,
) -> EngineResult<()> {
    let mut state: HwDebugState = getregset(pid, NT_ARM_HW_WATCH)?;
    let ctrl = 1 | (0b10 << 1) | (lsc_bits(kind) << 3) | (size_bas(size) << 5);
    state.dbg_regs[slot] = HwDebugReg { addr, ctrl, pad: 0 };
    setregset(pid, NT_ARM_HW_WATCH, &state)
}

pub fn clear_hw_watchpoint(pid: Pid, slot: usize) -> EngineResult<()> {
    let mut state: HwDebugState = getregset(pid, NT_ARM_HW_WATCH)?;
    state.dbg_regs[slot] = HwDebugReg::default();
    setregset(pid, NT_ARM_HW_WATCH, &state)
}

/// aarch64 doesn't expose a DR6-equivalent status register to userspace;
/// the trap reason is instead read from siginfo (`si_code`) by the caller,
/// so this always reports "unknown slot" and the exception dispatcher falls
/// back to matching on PC against the known breakpoint table.
pub fn hw_hit_slot(_pid: Pid) -> EngineResult<Option<usize>> {
    Ok(None)
}
