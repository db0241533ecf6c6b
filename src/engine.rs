//! The public surface (§6): owns the debug loop thread and the command
//! queue handle, and is the only thing an embedding host touches.

use crate::command::{self, Command, CommandQueueHandle, SpawnOutcome};
use crate::debug_loop::DebugLoop;
use crate::error::{EngineError, EngineResult};
use crate::exception::ExceptionRecord;
use crate::logging::{LogLevel, LogSink};
use crate::memory::{self, MemoryMap};
use crate::signal_policy::{SignalConfig, SignalPolicy};
use crate::state::EngineInner;
use crate::watchpoint::WatchpointKind;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Constructor knobs the embedding host may override before `attach`/`spawn`
/// (§ Configuration — matches the teacher's `AttachOptions` pattern of
/// naming these explicitly rather than burying them as magic numbers).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_software_breakpoints: usize,
    pub watchpoint_slots: usize,
    pub stop_all_retry_budget: u32,
    pub stop_all_retry_interval: Duration,
    pub command_queue_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_software_breakpoints: 1_000_000,
            watchpoint_slots: 1,
            stop_all_retry_budget: 16,
            stop_all_retry_interval: Duration::from_millis(2),
            command_queue_poll_interval: Duration::from_millis(5),
        }
    }
}

/// Mirrors the teacher's `AttachOptions { kill_on_exit }`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttachOptions {
    pub kill_on_exit: bool,
}

type ExceptionSink = Box<dyn FnMut(ExceptionRecord) + Send>;

/// A live debugging session. Dropping this detaches from every attached
/// thread, clears every installed breakpoint/watchpoint, and joins the
/// debug loop thread (§5 resource-acquisition pairing).
pub struct Engine {
    state: Arc<Mutex<EngineInner>>,
    queue: CommandQueueHandle,
    signal_policy: Arc<SignalPolicy>,
    exception_sink: Arc<Mutex<Option<ExceptionSink>>>,
    log_sink: Arc<Mutex<Option<LogSink>>>,
    degraded: Arc<AtomicBool>,
    loop_handle: Option<JoinHandle<()>>,
}

impl Engine {
    fn start(config: EngineConfig) -> (Self, crossbeam_channel::Receiver<Command>) {
        let state = Arc::new(Mutex::new(EngineInner::new(
            config.max_software_breakpoints,
            config.watchpoint_slots,
        )));
        let (tx, rx) = command::channel();
        let queue = CommandQueueHandle::new(tx);
        let signal_policy = Arc::new(SignalPolicy::new());
        let exception_sink = Arc::new(Mutex::new(None));
        let log_sink = Arc::new(Mutex::new(None));
        let degraded = Arc::new(AtomicBool::new(false));

        let engine = Engine {
            state,
            queue,
            signal_policy,
            exception_sink,
            log_sink,
            degraded,
            loop_handle: None,
        };
        (engine, rx)
    }

    fn spawn_loop(&mut self, rx: crossbeam_channel::Receiver<Command>, config: EngineConfig) {
        let debug_loop = DebugLoop::new(
            self.state.clone(),
            rx,
            self.signal_policy.clone(),
            self.exception_sink.clone(),
            self.log_sink.clone(),
            config,
            self.degraded.clone(),
        );
        self.loop_handle = Some(
            std::thread::Builder::new()
                .name("dbgengine-loop".into())
                .spawn(move || debug_loop.run())
                .expect("failed to spawn debug loop thread"),
        );
    }

    /// Attaches to every task of an already-running process (§6).
    ///
    /// ptrace has thread affinity: the attaching `seize`/`interrupt` calls
    /// must run on the same OS thread that will later issue every other
    /// ptrace call for this target, so attach is itself submitted as the
    /// first command to the freshly spawned loop rather than done here.
    pub fn attach(pid: i32, config: EngineConfig, options: AttachOptions) -> EngineResult<Self> {
        let (mut engine, rx) = Engine::start(config.clone());
        engine.spawn_loop(rx, config);
        engine.queue.call(|reply| Command::AttachAll {
            pid,
            kill_on_exit: options.kill_on_exit,
            reply,
        })?;
        Ok(engine)
    }

    /// Spawns a new child under trace (§6 "Spawn contract").
    pub fn spawn(
        path: &str,
        argv: &[String],
        with_pty: bool,
        config: EngineConfig,
    ) -> EngineResult<(Self, SpawnOutcome)> {
        let (mut engine, rx) = Engine::start(config.clone());
        engine.spawn_loop(rx, config);
        let outcome = engine.queue.call(|reply| Command::Spawn {
            path: path.to_string(),
            argv: argv.to_vec(),
            with_pty,
            reply,
        })?;
        Ok((engine, outcome))
    }

    fn degraded_check(&self) -> EngineResult<()> {
        if self.degraded.load(Ordering::SeqCst) {
            Err(EngineError::InternalInvariant("engine is degraded"))
        } else {
            Ok(())
        }
    }

    pub fn set_hardware_breakpoint(&self, address: u64, target_count: u64) -> EngineResult<u64> {
        self.degraded_check()?;
        self.queue.call(|reply| Command::SetBreakpoint {
            address,
            target_count,
            is_software: false,
            reply,
        })
    }

    pub fn set_software_breakpoint(&self, address: u64, target_count: u64) -> EngineResult<u64> {
        self.degraded_check()?;
        self.queue.call(|reply| Command::SetBreakpoint {
            address,
            target_count,
            is_software: true,
            reply,
        })
    }

    pub fn remove_breakpoint(&self, address: u64) -> EngineResult<()> {
        self.degraded_check()?;
        self.queue.call(|reply| Command::RemoveBreakpoint { address, reply })
    }

    pub fn set_watchpoint(&self, address: u64, size: u8, kind: WatchpointKind) -> EngineResult<usize> {
        self.degraded_check()?;
        self.queue.call(|reply| Command::SetWatchpoint {
            address,
            size,
            kind,
            reply,
        })
    }

    pub fn remove_watchpoint(&self, address: u64) -> EngineResult<()> {
        self.degraded_check()?;
        self.queue.call(|reply| Command::RemoveWatchpoint { address, reply })
    }

    pub fn continue_execution(&self, tid: i32) -> EngineResult<()> {
        self.degraded_check()?;
        self.queue.call(|reply| Command::ContinueExecution { tid, reply })
    }

    pub fn single_step(&self, tid: i32) -> EngineResult<()> {
        self.degraded_check()?;
        self.queue.call(|reply| Command::SingleStep { tid, reply })
    }

    pub fn read_register(&self, tid: i32, name: &str) -> EngineResult<u64> {
        self.degraded_check()?;
        self.queue.call(|reply| Command::ReadRegister {
            tid,
            name: name.to_string(),
            reply,
        })
    }

    pub fn write_register(&self, tid: i32, name: &str, value: u64) -> EngineResult<()> {
        self.degraded_check()?;
        self.queue.call(|reply| Command::WriteRegister {
            tid,
            name: name.to_string(),
            value,
            reply,
        })
    }

    pub fn read_memory(&self, address: u64, size: usize) -> EngineResult<Vec<u8>> {
        self.degraded_check()?;
        self.queue.call(|reply| Command::ReadMemory { address, size, reply })
    }

    /// Parses `/proc/<pid>/maps` for the attached target (§F memory map
    /// introspection). Does not go through the command queue: it only
    /// reads procfs, never touches ptrace state, so it can run on the
    /// calling thread directly, same as the teacher's `memory_maps`.
    pub fn memory_maps(&self) -> EngineResult<Vec<MemoryMap>> {
        let pid = self.state.lock().pid.ok_or(EngineError::NotAttached)?;
        memory::memory_maps(pid.as_raw())
    }

    pub fn set_signal_config(&self, signal: i32, config: SignalConfig) {
        self.signal_policy.set(signal, config);
    }

    pub fn get_signal_config(&self, signal: i32) -> SignalConfig {
        self.signal_policy.get(signal)
    }

    pub fn get_all_signal_configs(&self) -> HashMap<i32, SignalConfig> {
        self.signal_policy.get_all()
    }

    /// Registers the exception sink. At most one at a time; replacing it is
    /// safe between events since the dispatcher only ever locks it for the
    /// duration of a single callback invocation (§6).
    pub fn set_exception_sink(&self, sink: impl FnMut(ExceptionRecord) + Send + 'static) {
        *self.exception_sink.lock() = Some(Box::new(sink));
    }

    pub fn clear_exception_sink(&self) {
        *self.exception_sink.lock() = None;
    }

    /// Registers the diagnostic log sink (§6 `set_log_callback`). Internal
    /// diagnostics always also flow through the `log` crate regardless of
    /// whether a sink is registered here.
    pub fn set_log_callback(&self, sink: impl FnMut(LogLevel, &str) + Send + 'static) {
        *self.log_sink.lock() = Some(Box::new(sink));
    }

    pub fn clear_log_callback(&self) {
        *self.log_sink.lock() = None;
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Detach itself runs on the debug loop thread (ptrace's thread
    /// affinity requirement, same reason `attach` submits `AttachAll`
    /// rather than seizing from the caller's thread) — `Command::Shutdown`
    /// triggers it there; this only needs to request shutdown and wait for
    /// the loop to actually exit.
    fn teardown(&mut self) {
        if self.degraded.load(Ordering::SeqCst) {
            // Degraded engines may have threads stuck mid-dispatch; still
            // attempt shutdown so the OS thread doesn't leak, but don't
            // wait on a reply that may never come.
            self.queue.shutdown();
        } else {
            let _ = self.queue.call::<()>(|reply| Command::ResumeAllUserStoppedThreads { reply });
            self.queue.shutdown();
        }
        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.teardown();
    }
}
