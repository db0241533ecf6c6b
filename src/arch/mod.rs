//! Architecture layer: encode/decode hardware debug registers, read/write
//! general registers via ptrace, and carry register snapshot records.
//!
//! Only one of the two architecture modules is compiled in; both expose the
//! same surface (`GpRegs`, `get_gp_regs`, `set_gp_regs`, `HW_BP_SLOTS`,
//! `TRAP_INSN`, `install_hw_breakpoint`, ...) so the rest of the crate never
//! needs a `cfg` of its own.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::*;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("dbgengine only supports Linux on x86_64 and aarch64");
