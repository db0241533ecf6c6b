//! A Linux userspace debugger engine: ptrace-backed hardware and software
//! breakpoints, a hardware watchpoint, register and memory access, and an
//! exception dispatcher, all driven from a single owning debug-loop thread
//! that every other caller reaches through a typed command queue.
//!
//! [`Engine`] is the entry point: [`Engine::attach`] an already-running
//! process or [`Engine::spawn`] a new one under trace, register an
//! [`ExceptionRecord`] sink with [`Engine::set_exception_sink`], then drive
//! it with breakpoints, watchpoints, register/memory access and
//! continue/single-step.

pub mod arch;
pub mod breakpoint;
pub mod command;
pub mod debug_loop;
pub mod engine;
pub mod error;
pub mod exception;
pub mod herder;
pub mod logging;
pub mod memory;
pub mod signal_policy;
pub mod spawn;
pub mod state;
pub mod thread_state;
pub mod watchpoint;

pub use engine::{AttachOptions, Engine, EngineConfig};
pub use error::{EngineError, EngineResult};
pub use exception::{ExceptionKind, ExceptionRecord};
pub use logging::LogLevel;
pub use signal_policy::SignalConfig;
pub use watchpoint::WatchpointKind;
