//! The owning debugger thread (§4.1). This is the only code in the crate
//! that is allowed to call into ptrace directly outside of `arch::*`/
//! `memory.rs`/`herder.rs`/`spawn.rs` helpers, and it is the only thread
//! that ever calls those helpers — everything else reaches the target
//! through `command::Command`.

use crate::arch::GpRegs;
use crate::command::{Command, SpawnOutcome};
use crate::engine::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::exception::{self, ExceptionKind, ExceptionRecord, TrapReason};
use crate::herder;
use crate::logging::{self, LogLevel, LogSink};
use crate::memory;
use crate::signal_policy::SignalPolicy;
use crate::spawn;
use crate::state::EngineInner;
use crate::thread_state::{SingleStepMode, ThreadState};
use crate::watchpoint::WatchpointKind;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::convert::TryFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type ExceptionSink = Box<dyn FnMut(ExceptionRecord) + Send>;

pub struct DebugLoop {
    state: Arc<Mutex<EngineInner>>,
    commands: Receiver<Command>,
    signal_policy: Arc<SignalPolicy>,
    exception_sink: Arc<Mutex<Option<ExceptionSink>>>,
    log_sink: Arc<Mutex<Option<LogSink>>>,
    config: EngineConfig,
    degraded: Arc<AtomicBool>,
}

impl DebugLoop {
    pub fn new(
        state: Arc<Mutex<EngineInner>>,
        commands: Receiver<Command>,
        signal_policy: Arc<SignalPolicy>,
        exception_sink: Arc<Mutex<Option<ExceptionSink>>>,
        log_sink: Arc<Mutex<Option<LogSink>>>,
        config: EngineConfig,
        degraded: Arc<AtomicBool>,
    ) -> Self {
        DebugLoop {
            state,
            commands,
            signal_policy,
            exception_sink,
            log_sink,
            config,
            degraded,
        }
    }

    fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        logging::emit(&self.log_sink, level, message.as_ref());
    }

    /// Runs until a `Shutdown` command arrives or the command channel is
    /// dropped. Never panics on a caller-reachable error path (§7); the
    /// worst a bad stop can do is flip `degraded`.
    pub fn run(mut self) {
        loop {
            let mut shutdown = false;
            loop {
                match self.commands.try_recv() {
                    Ok(Command::Shutdown) => {
                        shutdown = true;
                        break;
                    }
                    Ok(command) => self.execute_command(command),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        shutdown = true;
                        break;
                    }
                }
            }
            if shutdown {
                // Detach runs here, not in the caller's `Drop`: ptrace calls
                // are bound to the thread that issued the original attach,
                // which is this one (§5 resource-acquisition pairing).
                self.do_detach_all();
                break;
            }

            self.discover_new_threads();

            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL)) {
                Ok(WaitStatus::StillAlive) => {
                    std::thread::sleep(self.config.command_queue_poll_interval);
                }
                Ok(status) => self.handle_stop_event(status),
                Err(nix::Error::ECHILD) => {
                    std::thread::sleep(self.config.command_queue_poll_interval);
                }
                Err(e) => self.log(LogLevel::Warn, format!("waitpid(-1) failed: {e}")),
            }
        }
        self.log(LogLevel::Debug, "debug loop exiting");
    }

    // ---- command dispatch ------------------------------------------------

    fn execute_command(&mut self, command: Command) {
        if self.degraded.load(Ordering::SeqCst) {
            Self::reply_degraded(command);
            return;
        }
        match command {
            Command::SetBreakpoint {
                address,
                target_count,
                is_software,
                reply,
            } => {
                let result = if is_software {
                    self.do_set_software_breakpoint(address, target_count)
                } else {
                    self.do_set_hardware_breakpoint(address, target_count)
                };
                self.finish(result, reply);
            }
            Command::RemoveBreakpoint { address, reply } => {
                let result = self.do_remove_breakpoint(address);
                self.finish(result, reply);
            }
            Command::SetWatchpoint {
                address,
                size,
                kind,
                reply,
            } => {
                let result = self.do_set_watchpoint(address, size, kind);
                self.finish(result, reply);
            }
            Command::RemoveWatchpoint { address, reply } => {
                let result = self.do_remove_watchpoint(address);
                self.finish(result, reply);
            }
            Command::ContinueExecution { tid, reply } => {
                let result = self.do_continue(tid);
                self.finish(result, reply);
            }
            Command::SingleStep { tid, reply } => {
                let result = self.do_single_step(tid);
                self.finish(result, reply);
            }
            Command::ReadRegister { tid, name, reply } => {
                let result = self.do_read_register(tid, &name);
                self.finish(result, reply);
            }
            Command::WriteRegister {
                tid,
                name,
                value,
                reply,
            } => {
                let result = self.do_write_register(tid, &name, value);
                self.finish(result, reply);
            }
            Command::ReadMemory {
                address,
                size,
                reply,
            } => {
                let result = self.do_read_memory(address, size);
                self.finish(result, reply);
            }
            Command::Spawn {
                path,
                argv,
                with_pty,
                reply,
            } => {
                let result = self.do_spawn(&path, &argv, with_pty);
                self.finish(result, reply);
            }
            Command::AttachAll {
                pid,
                kill_on_exit,
                reply,
            } => {
                let result = self.do_attach_all(pid, kill_on_exit);
                self.finish(result, reply);
            }
            Command::ResumeAllUserStoppedThreads { reply } => {
                let result = self.do_resume_all_user_stopped();
                self.finish(result, reply);
            }
            Command::Shutdown => unreachable!("handled by caller before dispatch"),
        }
    }

    fn finish<T>(&mut self, result: EngineResult<T>, reply: Sender<EngineResult<T>>) {
        if let Err(EngineError::InternalInvariant(msg)) = &result {
            self.log(LogLevel::Error, format!("internal invariant violated, degrading engine: {msg}"));
            self.degraded.store(true, Ordering::SeqCst);
        }
        let _ = reply.send(result);
    }

    fn reply_degraded(command: Command) {
        let degraded = || EngineError::InternalInvariant("engine is degraded");
        match command {
            Command::SetBreakpoint { reply, .. } => {
                let _ = reply.send(Err(degraded()));
            }
            Command::RemoveBreakpoint { reply, .. } => {
                let _ = reply.send(Err(degraded()));
            }
            Command::SetWatchpoint { reply, .. } => {
                let _ = reply.send(Err(degraded()));
            }
            Command::RemoveWatchpoint { reply, .. } => {
                let _ = reply.send(Err(degraded()));
            }
            Command::ContinueExecution { reply, .. } => {
                let _ = reply.send(Err(degraded()));
            }
            Command::SingleStep { reply, .. } => {
                let _ = reply.send(Err(degraded()));
            }
            Command::ReadRegister { reply, .. } => {
                let _ = reply.send(Err(degraded()));
            }
            Command::WriteRegister { reply, .. } => {
                let _ = reply.send(Err(degraded()));
            }
            Command::ReadMemory { reply, .. } => {
                let _ = reply.send(Err(degraded()));
            }
            Command::Spawn { reply, .. } => {
                let _ = reply.send(Err(degraded()));
            }
            Command::AttachAll { reply, .. } => {
                let _ = reply.send(Err(degraded()));
            }
            Command::ResumeAllUserStoppedThreads { reply } => {
                let _ = reply.send(Err(degraded()));
            }
            Command::Shutdown => {}
        }
    }

    // ---- attach / spawn ---------------------------------------------------

    fn do_attach_all(&mut self, pid: i32, kill_on_exit: bool) -> EngineResult<()> {
        let mut inner = self.state.lock();
        herder::attach_all(pid, &mut inner.threads)?;
        inner.pid = Some(Pid::from_raw(pid));
        if kill_on_exit {
            for tid in inner.attached_tids() {
                let _ = ptrace::setoptions(Pid::from_raw(tid), ptrace::Options::PTRACE_O_EXITKILL);
            }
        }
        Ok(())
    }

    fn do_spawn(&mut self, path: &str, argv: &[String], with_pty: bool) -> EngineResult<SpawnOutcome> {
        let spawned = spawn::spawn(path, argv, with_pty)?;
        let pid = spawned.pid;
        let pty_master_fd = spawned.pty_master_fd;
        drop(spawned.into_child());

        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(_, _)) => {}
            Ok(WaitStatus::Exited(_, code)) => {
                return Err(EngineError::SpawnFailed(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("child exited immediately with status {code}"),
                )))
            }
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }
        ptrace::setoptions(pid, ptrace::Options::PTRACE_O_EXITKILL)?;

        let mut inner = self.state.lock();
        inner.pid = Some(pid);
        let mut state = ThreadState::new(pid.as_raw());
        state.is_attached = true;
        state.is_stopped = true;
        inner.threads.insert(pid.as_raw(), state);

        Ok(SpawnOutcome {
            pid: pid.as_raw(),
            pty_master_fd,
        })
    }

    /// Polls `/proc/<pid>/task` for tasks not yet in the thread-state map
    /// and attaches them; existing hardware BP/WP state is reapplied to any
    /// newly discovered thread so it starts out consistent with its peers
    /// (§4.2 "newly-spawned threads are discovered lazily").
    fn discover_new_threads(&mut self) {
        let pid = match self.state.lock().pid {
            Some(p) => p.as_raw(),
            None => return,
        };
        let tasks = match herder::enumerate_tasks(pid) {
            Ok(t) => t,
            Err(_) => return,
        };
        let mut discovered = false;
        for tid in tasks {
            let known = self.state.lock().threads.contains_key(&tid);
            if known {
                continue;
            }
            if herder::attach_one(tid).is_ok() {
                let mut inner = self.state.lock();
                let mut state = ThreadState::new(tid);
                state.is_attached = true;
                state.is_stopped = true;
                inner.threads.insert(tid, state);
                discovered = true;
            }
        }
        if discovered {
            let _ = self.do_reapply_watchpoints();
        }
    }

    fn do_reapply_watchpoints(&mut self) -> EngineResult<()> {
        let mut inner = self.state.lock();
        if inner.pid.is_none() {
            return Err(EngineError::NotAttached);
        }
        let watchpoint_slots = inner.watchpoints.capacity();
        let newly_stopped = herder::stop_all(
            &mut inner.threads,
            self.config.stop_all_retry_budget,
            self.config.stop_all_retry_interval,
        )?;
        let tids = inner.attached_tids();
        for tid in &tids {
            let pid = Pid::from_raw(*tid);
            for (index, slot) in inner.hw_breakpoints.iter_used() {
                let _ = crate::arch::install_hw_breakpoint(pid, index, slot.address);
            }
            for (index, slot) in inner.watchpoints.iter_used() {
                let physical = crate::arch::watchpoint_physical_index(index, watchpoint_slots);
                let _ = crate::arch::install_hw_watchpoint(pid, physical, slot.address, slot.size, slot.kind);
            }
        }
        herder::resume_all(&newly_stopped, &mut inner.threads)?;
        Ok(())
    }

    /// Clears every installed breakpoint and watchpoint (restoring original
    /// bytes and debug registers) before detaching every attached thread, per
    /// §5's resource-acquisition pairing: every install this engine performed
    /// is undone before the threads it installed them on are let go.
    /// Detach itself is best-effort: a thread that already exited is simply
    /// skipped (`herder::detach_one` tolerates `ESRCH`).
    fn do_detach_all(&mut self) {
        let (hw_addresses, sw_addresses, watch_addresses) = {
            let inner = self.state.lock();
            let hw: Vec<u64> = inner.hw_breakpoints.iter_used().map(|(_, s)| s.address).collect();
            let sw: Vec<u64> = inner.sw_breakpoints.iter().map(|e| e.address).collect();
            let watch: Vec<u64> = inner.watchpoints.iter_used().map(|(_, s)| s.address).collect();
            (hw, sw, watch)
        };
        for address in hw_addresses.into_iter().chain(sw_addresses) {
            if let Err(e) = self.do_remove_breakpoint(address) {
                self.log(
                    LogLevel::Warn,
                    format!("error restoring breakpoint at {address:#x} during shutdown: {e}"),
                );
            }
        }
        for address in watch_addresses {
            if let Err(e) = self.do_remove_watchpoint(address) {
                self.log(
                    LogLevel::Warn,
                    format!("error clearing watchpoint at {address:#x} during shutdown: {e}"),
                );
            }
        }
        let mut inner = self.state.lock();
        if let Err(e) = herder::detach_all(&mut inner.threads) {
            self.log(LogLevel::Warn, format!("error detaching threads during shutdown: {e}"));
        }
    }

    fn do_resume_all_user_stopped(&mut self) -> EngineResult<()> {
        let mut inner = self.state.lock();
        let tids: Vec<i32> = inner
            .threads
            .iter()
            .filter(|(_, s)| s.stopped_by_user && s.is_stopped)
            .map(|(tid, _)| *tid)
            .collect();
        for tid in &tids {
            if let Some(s) = inner.threads.get_mut(tid) {
                s.stopped_by_user = false;
            }
        }
        herder::resume_all(&tids, &mut inner.threads)?;
        Ok(())
    }

    // ---- breakpoints --------------------------------------------------

    fn do_set_hardware_breakpoint(&mut self, address: u64, target_count: u64) -> EngineResult<u64> {
        let mut inner = self.state.lock();
        if inner.pid.is_none() {
            return Err(EngineError::NotAttached);
        }
        if inner.hw_breakpoints.find(address).is_some() {
            return Err(EngineError::DuplicateAddress(address));
        }
        let capacity = crate::arch::breakpoint_capacity(inner.watchpoints.capacity());
        if inner.hw_breakpoints.iter_used().count() >= capacity {
            return Err(EngineError::NoFreeSlot);
        }

        let newly_stopped = herder::stop_all(
            &mut inner.threads,
            self.config.stop_all_retry_budget,
            self.config.stop_all_retry_interval,
        )?;
        let index = match inner.hw_breakpoints.allocate(address, target_count) {
            Ok(i) => i,
            Err(e) => {
                herder::resume_all(&newly_stopped, &mut inner.threads)?;
                return Err(e);
            }
        };

        let tids = inner.attached_tids();
        let mut install_err = None;
        for tid in &tids {
            if let Err(e) = crate::arch::install_hw_breakpoint(Pid::from_raw(*tid), index, address) {
                install_err = Some(e);
                break;
            }
        }
        if let Some(e) = install_err {
            for tid in &tids {
                let _ = crate::arch::clear_hw_breakpoint(Pid::from_raw(*tid), index);
            }
            inner.hw_breakpoints.release(index);
            herder::resume_all(&newly_stopped, &mut inner.threads)?;
            return Err(e);
        }

        herder::resume_all(&newly_stopped, &mut inner.threads)?;
        drop(inner);
        self.drain_buffered_events();
        Ok(index as u64)
    }

    fn do_set_software_breakpoint(&mut self, address: u64, target_count: u64) -> EngineResult<u64> {
        let mut inner = self.state.lock();
        let pid = inner.pid.ok_or(EngineError::NotAttached)?;
        if inner.sw_breakpoints.get(address).is_some() {
            return Err(EngineError::DuplicateAddress(address));
        }
        let trap = crate::arch::TRAP_INSN;
        let original = memory::read_memory(pid, address, trap.len())?;
        memory::write_memory(pid, address, trap)?;
        if let Err(e) = inner.sw_breakpoints.insert(address, original.clone(), target_count) {
            let _ = memory::write_memory(pid, address, &original);
            return Err(e);
        }
        Ok(address)
    }

    fn do_remove_breakpoint(&mut self, address: u64) -> EngineResult<()> {
        let mut inner = self.state.lock();
        if let Some(index) = inner.hw_breakpoints.find(address) {
            return self.remove_hardware_breakpoint_locked(&mut inner, index);
        }
        if inner.sw_breakpoints.get(address).is_some() {
            return self.remove_software_breakpoint_locked(&mut inner, address);
        }
        Err(EngineError::NotFound(address))
    }

    fn remove_hardware_breakpoint_locked(&self, inner: &mut EngineInner, index: usize) -> EngineResult<()> {
        inner
            .hw_breakpoints
            .sync(index)
            .removing
            .store(true, Ordering::SeqCst);
        self.spin_until_handlers_clear(inner.hw_breakpoints.sync(index))?;

        let newly_stopped = herder::stop_all(
            &mut inner.threads,
            self.config.stop_all_retry_budget,
            self.config.stop_all_retry_interval,
        )?;
        for tid in inner.attached_tids() {
            let _ = crate::arch::clear_hw_breakpoint(Pid::from_raw(tid), index);
        }
        inner.hw_breakpoints.release(index);
        herder::resume_all(&newly_stopped, &mut inner.threads)?;
        inner
            .hw_breakpoints
            .sync(index)
            .removing
            .store(false, Ordering::SeqCst);
        Ok(())
    }

    fn remove_software_breakpoint_locked(&self, inner: &mut EngineInner, address: u64) -> EngineResult<()> {
        if let Some(sync) = inner.sw_breakpoints.sync(address) {
            sync.removing.store(true, Ordering::SeqCst);
            self.spin_until_handlers_clear(sync)?;
        }
        let pid = inner.pid.ok_or(EngineError::NotAttached)?;
        let original = inner
            .sw_breakpoints
            .get(address)
            .ok_or(EngineError::NotFound(address))?
            .original_bytes
            .clone();
        memory::write_memory(pid, address, &original)?;
        inner.sw_breakpoints.remove(address)?;
        Ok(())
    }

    fn spin_until_handlers_clear(&self, sync: &crate::watchpoint::SlotSync) -> EngineResult<()> {
        for _ in 0..self.config.stop_all_retry_budget {
            if sync.active_handlers.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }
            std::thread::sleep(self.config.stop_all_retry_interval);
        }
        if sync.active_handlers.load(Ordering::SeqCst) == 0 {
            Ok(())
        } else {
            Err(EngineError::InternalInvariant(
                "active_handlers did not drain before slot removal",
            ))
        }
    }

    // ---- watchpoints ----------------------------------------------------

    fn do_set_watchpoint(&mut self, address: u64, size: u8, kind: WatchpointKind) -> EngineResult<usize> {
        let mut inner = self.state.lock();
        if inner.pid.is_none() {
            return Err(EngineError::NotAttached);
        }
        if inner.watchpoints.find(address).is_some() {
            return Err(EngineError::DuplicateAddress(address));
        }
        let watchpoint_slots = inner.watchpoints.capacity();

        let newly_stopped = herder::stop_all(
            &mut inner.threads,
            self.config.stop_all_retry_budget,
            self.config.stop_all_retry_interval,
        )?;
        let logical_index = match inner.watchpoints.allocate(address, size, kind) {
            Ok(i) => i,
            Err(e) => {
                herder::resume_all(&newly_stopped, &mut inner.threads)?;
                return Err(e);
            }
        };
        let physical = crate::arch::watchpoint_physical_index(logical_index, watchpoint_slots);

        let tids = inner.attached_tids();
        let mut install_err = None;
        for tid in &tids {
            if let Err(e) = crate::arch::install_hw_watchpoint(Pid::from_raw(*tid), physical, address, size, kind) {
                install_err = Some(e);
                break;
            }
        }
        if let Some(e) = install_err {
            for tid in &tids {
                let _ = crate::arch::clear_hw_watchpoint(Pid::from_raw(*tid), physical);
            }
            inner.watchpoints.release(logical_index);
            herder::resume_all(&newly_stopped, &mut inner.threads)?;
            return Err(e);
        }

        herder::resume_all(&newly_stopped, &mut inner.threads)?;
        drop(inner);
        self.drain_buffered_events();
        Ok(logical_index)
    }

    fn do_remove_watchpoint(&mut self, address: u64) -> EngineResult<()> {
        let mut inner = self.state.lock();
        let index = inner.watchpoints.find(address).ok_or(EngineError::NotFound(address))?;
        let watchpoint_slots = inner.watchpoints.capacity();
        let physical = crate::arch::watchpoint_physical_index(index, watchpoint_slots);

        inner
            .watchpoints
            .sync(index)
            .removing
            .store(true, Ordering::SeqCst);
        self.spin_until_handlers_clear(inner.watchpoints.sync(index))?;

        let newly_stopped = herder::stop_all(
            &mut inner.threads,
            self.config.stop_all_retry_budget,
            self.config.stop_all_retry_interval,
        )?;
        for tid in inner.attached_tids() {
            let _ = crate::arch::clear_hw_watchpoint(Pid::from_raw(tid), physical);
        }
        inner.watchpoints.release(index);
        herder::resume_all(&newly_stopped, &mut inner.threads)?;
        inner
            .watchpoints
            .sync(index)
            .removing
            .store(false, Ordering::SeqCst);
        Ok(())
    }

    // ---- thread-directed commands ---------------------------------------

    fn require_attached(&self) -> EngineResult<Pid> {
        self.state.lock().pid.ok_or(EngineError::NotAttached)
    }

    /// Resumes `tid`, transparently stepping it past any breakpoint sitting
    /// under its current PC rather than letting it re-trigger immediately
    /// (`HardwareBPContinue`/`SoftwareBPContinue` never deliver an event —
    /// the hit was already accounted for whenever the breakpoint originally
    /// fired).
    fn do_continue(&mut self, tid: i32) -> EngineResult<()> {
        self.require_attached()?;
        let pid = Pid::from_raw(tid);
        let pc = crate::arch::get_gp_regs(pid)?.pc();

        let (hw_index, sw_address) = {
            let inner = self.state.lock();
            (inner.hw_breakpoints.find(pc), inner.sw_breakpoints.get(pc).map(|_| pc))
        };
        if let Some(index) = hw_index {
            return self.step_over_hardware_breakpoint(pid, index, SingleStepMode::HardwareBPContinue);
        }
        if let Some(address) = sw_address {
            return self.step_over_software_breakpoint(pid, address, SingleStepMode::SoftwareBPContinue);
        }

        self.resume_thread_default(pid)
    }

    fn step_over_hardware_breakpoint(&mut self, pid: Pid, index: usize, mode: SingleStepMode) -> EngineResult<()> {
        let tid = pid.as_raw();
        crate::arch::clear_hw_breakpoint(pid, index)?;
        ptrace::step(pid, None)?;
        let mut inner = self.state.lock();
        if let Some(state) = inner.threads.get_mut(&tid) {
            state.begin_rearm(mode, index as i32);
            state.is_stopped = false;
        }
        Ok(())
    }

    fn step_over_software_breakpoint(&mut self, pid: Pid, address: u64, mode: SingleStepMode) -> EngineResult<()> {
        let tid = pid.as_raw();
        let original = {
            let inner = self.state.lock();
            inner
                .sw_breakpoints
                .get(address)
                .ok_or(EngineError::NotFound(address))?
                .original_bytes
                .clone()
        };
        memory::write_memory(pid, address, &original)?;
        ptrace::step(pid, None)?;
        let mut inner = self.state.lock();
        if let Some(state) = inner.threads.get_mut(&tid) {
            state.pending_sw_bp_address = Some(address);
            state.begin_rearm(mode, -1);
            state.is_stopped = false;
        }
        Ok(())
    }

    fn do_single_step(&mut self, tid: i32) -> EngineResult<()> {
        self.require_attached()?;
        let pid = Pid::from_raw(tid);
        ptrace::step(pid, None).map_err(|e| {
            if e == nix::Error::ESRCH {
                EngineError::ThreadGone(tid)
            } else {
                e.into()
            }
        })?;
        let mut inner = self.state.lock();
        if let Some(state) = inner.threads.get_mut(&tid) {
            state.is_stopped = false;
        }
        Ok(())
    }

    fn do_read_register(&mut self, tid: i32, name: &str) -> EngineResult<u64> {
        self.require_attached()?;
        crate::arch::get_gp_regs(Pid::from_raw(tid))?.read_named(name)
    }

    fn do_write_register(&mut self, tid: i32, name: &str, value: u64) -> EngineResult<()> {
        self.require_attached()?;
        let pid = Pid::from_raw(tid);
        let mut regs = crate::arch::get_gp_regs(pid)?;
        regs.write_named(name, value)?;
        crate::arch::set_gp_regs(pid, &regs)
    }

    fn do_read_memory(&mut self, address: u64, size: usize) -> EngineResult<Vec<u8>> {
        let pid = self.require_attached()?;
        memory::read_memory(pid, address, size)
    }

    // ---- stop-event handling --------------------------------------------

    fn drain_buffered_events(&mut self) {
        let buffered: Vec<WaitStatus> = {
            let mut inner = self.state.lock();
            inner
                .threads
                .values_mut()
                .filter_map(|s| s.buffered_event.take())
                .collect()
        };
        for status in buffered {
            self.handle_stop_event(status);
        }
    }

    fn ensure_known_thread(&mut self, tid: i32) {
        let mut inner = self.state.lock();
        if !inner.threads.contains_key(&tid) {
            let mut state = ThreadState::new(tid);
            state.is_attached = true;
            state.is_stopped = true;
            inner.threads.insert(tid, state);
        }
    }

    fn handle_stop_event(&mut self, status: WaitStatus) {
        let tid = match status.pid() {
            Some(p) => p.as_raw(),
            None => return,
        };
        match status {
            WaitStatus::Exited(_, code) => {
                self.log(LogLevel::Debug, format!("tid {tid} exited with status {code}"));
                self.state.lock().threads.remove(&tid);
            }
            WaitStatus::Signaled(_, signal, _) => {
                self.log(LogLevel::Debug, format!("tid {tid} killed by {signal:?}"));
                self.state.lock().threads.remove(&tid);
            }
            WaitStatus::Stopped(pid, Signal::SIGTRAP) => {
                self.ensure_known_thread(tid);
                self.handle_sigtrap(pid);
            }
            WaitStatus::Stopped(pid, signal) => {
                self.ensure_known_thread(tid);
                self.handle_other_signal(pid, signal);
            }
            WaitStatus::PtraceEvent(_, _, _) => {
                self.ensure_known_thread(tid);
                if let Some(s) = self.state.lock().threads.get_mut(&tid) {
                    s.is_stopped = true;
                }
            }
            _ => {}
        }
    }

    fn handle_sigtrap(&mut self, pid: Pid) {
        let tid = pid.as_raw();
        let mode = {
            let inner = self.state.lock();
            inner
                .threads
                .get(&tid)
                .map(|s| s.single_step_mode)
                .unwrap_or(SingleStepMode::None)
        };
        if mode != SingleStepMode::None {
            self.advance_rearm(pid, mode);
            return;
        }

        if exception::classify_trap(pid) == TrapReason::SingleStep {
            self.log(LogLevel::Trace, format!("stray single-step trap on tid {tid}, resuming"));
            let _ = self.resume_thread_default(pid);
            return;
        }

        let regs = match crate::arch::get_gp_regs(pid) {
            Ok(r) => r,
            Err(_) => {
                let _ = self.resume_thread_default(pid);
                return;
            }
        };
        let pc = regs.pc();

        // x86_64 reports a definitive DR6 hit slot; aarch64 has none and
        // falls through to the PC/address-table lookups below.
        if let Ok(Some(slot)) = crate::arch::hw_hit_slot(pid) {
            self.dispatch_hardware_breakpoint_hit(pid, slot, regs);
            return;
        }

        let hw_index = {
            let inner = self.state.lock();
            inner.hw_breakpoints.find(pc)
        };
        if let Some(index) = hw_index {
            self.dispatch_hardware_breakpoint_hit(pid, index, regs);
            return;
        }

        let sw_address = pc.wrapping_sub(crate::arch::SW_BP_PC_ADJUST);
        let is_sw = {
            let inner = self.state.lock();
            inner.sw_breakpoints.get(sw_address).is_some()
        };
        if is_sw {
            self.dispatch_software_breakpoint_hit(pid, sw_address, regs);
            return;
        }

        // No DR6 and no PC match: the only other SIGTRAP source left is the
        // single configured watchpoint (aarch64 has no per-access fault
        // address visible to userspace either, so this is a best effort).
        let wp_index = {
            let inner = self.state.lock();
            inner.watchpoints.iter_used().next().map(|(i, _)| i)
        };
        if let Some(index) = wp_index {
            self.dispatch_watchpoint_hit(pid, index, regs);
            return;
        }

        self.log(LogLevel::Debug, format!("stray SIGTRAP on tid {tid} with no known cause, resuming"));
        let _ = self.resume_thread_default(pid);
    }

    fn advance_rearm(&mut self, pid: Pid, mode: SingleStepMode) {
        match mode {
            SingleStepMode::HardwareBPReArm => self.advance_hardware_rearm(pid, false),
            SingleStepMode::HardwareBPContinue => self.advance_hardware_rearm(pid, true),
            SingleStepMode::SoftwareBP => self.advance_software_rearm(pid, false),
            SingleStepMode::SoftwareBPContinue => self.advance_software_rearm(pid, true),
            SingleStepMode::WatchpointReArm => self.advance_watchpoint_rearm(pid),
            SingleStepMode::None => {}
        }
    }

    fn dispatch_hardware_breakpoint_hit(&mut self, pid: Pid, index: usize, regs: GpRegs) {
        let tid = pid.as_raw();
        let removing = {
            let inner = self.state.lock();
            inner.hw_breakpoints.sync(index).removing.load(Ordering::SeqCst)
        };
        if removing {
            let _ = self.resume_thread_default(pid);
            return;
        }
        {
            let inner = self.state.lock();
            inner.hw_breakpoints.sync(index).active_handlers.fetch_add(1, Ordering::SeqCst);
        }

        let _ = crate::arch::clear_hw_breakpoint(pid, index);
        if ptrace::step(pid, None).is_err() {
            let inner = self.state.lock();
            inner.hw_breakpoints.sync(index).active_handlers.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        let mut inner = self.state.lock();
        if let Some(state) = inner.threads.get_mut(&tid) {
            state.last_regs = Some(regs);
            state.begin_rearm(SingleStepMode::HardwareBPReArm, index as i32);
            state.is_stopped = false;
        }
    }

    fn advance_hardware_rearm(&mut self, pid: Pid, continuing: bool) {
        let tid = pid.as_raw();
        let index = {
            let inner = self.state.lock();
            inner.threads.get(&tid).map(|s| s.current_breakpoint_index).unwrap_or(-1)
        };
        if index < 0 {
            let _ = self.resume_thread_default(pid);
            return;
        }
        let index = index as usize;
        let address = { self.state.lock().hw_breakpoints.slot(index).address };
        let _ = crate::arch::install_hw_breakpoint(pid, index, address);

        let deliver = if continuing {
            false
        } else {
            let mut inner = self.state.lock();
            inner.hw_breakpoints.sync(index).active_handlers.fetch_sub(1, Ordering::SeqCst);
            let slot = inner.hw_breakpoints.slot_mut(index);
            slot.hit_count += 1;
            !(slot.target_count > 0 && slot.hit_count < slot.target_count)
        };

        let regs = {
            let mut inner = self.state.lock();
            inner.threads.get_mut(&tid).and_then(|s| s.last_regs.take())
        };
        if let Some(state) = self.state.lock().threads.get_mut(&tid) {
            state.clear_rearm();
        }

        match (deliver, regs) {
            (true, Some(regs)) => {
                let pc = regs.pc();
                self.emit_exception(ExceptionKind::Breakpoint, tid, pc, None, regs);
            }
            _ => {
                let _ = self.resume_thread_default(pid);
            }
        }
    }

    fn dispatch_software_breakpoint_hit(&mut self, pid: Pid, address: u64, regs: GpRegs) {
        let tid = pid.as_raw();
        let removing = {
            let inner = self.state.lock();
            inner.sw_breakpoints.sync(address).map(|s| s.removing.load(Ordering::SeqCst)).unwrap_or(false)
        };
        if removing {
            let _ = self.resume_thread_default(pid);
            return;
        }
        {
            let inner = self.state.lock();
            if let Some(sync) = inner.sw_breakpoints.sync(address) {
                sync.active_handlers.fetch_add(1, Ordering::SeqCst);
            }
        }

        let original = {
            let inner = self.state.lock();
            inner.sw_breakpoints.get(address).map(|e| e.original_bytes.clone())
        };
        let original = match original {
            Some(o) => o,
            None => {
                let _ = self.resume_thread_default(pid);
                return;
            }
        };

        // x86_64's int3 already advanced PC one byte past the trap; rewind
        // to the breakpoint address before anything reads/re-arms it.
        let mut fixed_regs = regs;
        fixed_regs.set_pc(address);
        let _ = crate::arch::set_gp_regs(pid, &fixed_regs);

        if memory::write_memory(pid, address, &original).is_err() {
            let _ = self.resume_thread_default(pid);
            return;
        }
        if ptrace::step(pid, None).is_err() {
            let _ = memory::write_memory(pid, address, crate::arch::TRAP_INSN);
            return;
        }

        let mut inner = self.state.lock();
        if let Some(state) = inner.threads.get_mut(&tid) {
            state.last_regs = Some(fixed_regs);
            state.pending_sw_bp_address = Some(address);
            state.begin_rearm(SingleStepMode::SoftwareBP, -1);
            state.is_stopped = false;
        }
    }

    fn advance_software_rearm(&mut self, pid: Pid, continuing: bool) {
        let tid = pid.as_raw();
        let address = {
            let inner = self.state.lock();
            inner.threads.get(&tid).and_then(|s| s.pending_sw_bp_address)
        };
        let address = match address {
            Some(a) => a,
            None => {
                let _ = self.resume_thread_default(pid);
                return;
            }
        };
        let _ = memory::write_memory(pid, address, crate::arch::TRAP_INSN);

        let deliver = if continuing {
            false
        } else {
            let mut inner = self.state.lock();
            if let Some(sync) = inner.sw_breakpoints.sync(address) {
                sync.active_handlers.fetch_sub(1, Ordering::SeqCst);
            }
            match inner.sw_breakpoints.get_mut(address) {
                Some(entry) => {
                    entry.hit_count += 1;
                    !(entry.target_count > 0 && entry.hit_count < entry.target_count)
                }
                None => false,
            }
        };

        let regs = {
            let mut inner = self.state.lock();
            inner.threads.get_mut(&tid).and_then(|s| s.last_regs.take())
        };
        if let Some(state) = self.state.lock().threads.get_mut(&tid) {
            state.clear_rearm();
        }

        match (deliver, regs) {
            (true, Some(regs)) => {
                self.emit_exception(ExceptionKind::Breakpoint, tid, address, None, regs);
            }
            _ => {
                let _ = self.resume_thread_default(pid);
            }
        }
    }

    fn dispatch_watchpoint_hit(&mut self, pid: Pid, index: usize, regs: GpRegs) {
        let tid = pid.as_raw();
        let removing = {
            let inner = self.state.lock();
            inner.watchpoints.sync(index).removing.load(Ordering::SeqCst)
        };
        if removing {
            let _ = self.resume_thread_default(pid);
            return;
        }
        {
            let inner = self.state.lock();
            inner.watchpoints.sync(index).active_handlers.fetch_add(1, Ordering::SeqCst);
        }

        let watchpoint_slots = { self.state.lock().watchpoints.capacity() };
        let physical = crate::arch::watchpoint_physical_index(index, watchpoint_slots);
        let _ = crate::arch::clear_hw_watchpoint(pid, physical);
        if ptrace::step(pid, None).is_err() {
            let inner = self.state.lock();
            inner.watchpoints.sync(index).active_handlers.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        let mut inner = self.state.lock();
        if let Some(state) = inner.threads.get_mut(&tid) {
            state.last_regs = Some(regs);
            state.disabled_watchpoint_index = index as i32;
            state.begin_rearm(SingleStepMode::WatchpointReArm, index as i32);
            state.is_stopped = false;
        }
    }

    fn advance_watchpoint_rearm(&mut self, pid: Pid) {
        let tid = pid.as_raw();
        let index = {
            let inner = self.state.lock();
            inner.threads.get(&tid).map(|s| s.current_breakpoint_index).unwrap_or(-1)
        };
        if index < 0 {
            let _ = self.resume_thread_default(pid);
            return;
        }
        let index = index as usize;

        let watchpoint_slots = { self.state.lock().watchpoints.capacity() };
        let physical = crate::arch::watchpoint_physical_index(index, watchpoint_slots);
        let (address, size, kind) = {
            let inner = self.state.lock();
            let slot = inner.watchpoints.slot(index);
            (slot.address, slot.size, slot.kind)
        };
        let _ = crate::arch::install_hw_watchpoint(pid, physical, address, size, kind);

        {
            let inner = self.state.lock();
            inner.watchpoints.sync(index).active_handlers.fetch_sub(1, Ordering::SeqCst);
        }

        let regs = {
            let mut inner = self.state.lock();
            inner.threads.get_mut(&tid).and_then(|s| s.last_regs.take())
        };
        if let Some(state) = self.state.lock().threads.get_mut(&tid) {
            state.clear_rearm();
            state.disabled_watchpoint_index = -1;
        }

        // Watchpoint slots carry no hit_count/target_count (§3): every hit
        // is reported, there is no silent-rearm path.
        if let Some(regs) = regs {
            let pc = regs.pc();
            self.emit_exception(ExceptionKind::Watchpoint, tid, pc, Some(address), regs);
        } else {
            let _ = self.resume_thread_default(pid);
        }
    }

    fn handle_other_signal(&mut self, pid: Pid, signal: Signal) {
        let tid = pid.as_raw();
        let config = self.signal_policy.get(signal as i32);
        {
            let mut inner = self.state.lock();
            if let Some(state) = inner.threads.get_mut(&tid) {
                state.pending_signal = if config.should_intercept {
                    0
                } else if config.should_pass_to_target {
                    signal as i32
                } else {
                    0
                };
            }
        }
        if config.should_report_to_client {
            if let Ok(regs) = crate::arch::get_gp_regs(pid) {
                let pc = regs.pc();
                self.emit_exception(ExceptionKind::Signal, tid, pc, None, regs);
            }
        }
        let _ = self.resume_thread_default(pid);
    }

    fn resume_thread_default(&mut self, pid: Pid) -> EngineResult<()> {
        let tid = pid.as_raw();
        let signal = {
            let inner = self.state.lock();
            inner
                .threads
                .get(&tid)
                .filter(|s| s.pending_signal != 0)
                .and_then(|s| Signal::try_from(s.pending_signal).ok())
        };
        match ptrace::cont(pid, signal) {
            Ok(()) | Err(nix::Error::ESRCH) => {}
            Err(e) => return Err(e.into()),
        }
        let mut inner = self.state.lock();
        if let Some(state) = inner.threads.get_mut(&tid) {
            state.is_stopped = false;
            state.pending_signal = 0;
        }
        Ok(())
    }

    fn emit_exception(&mut self, kind: ExceptionKind, tid: i32, pc: u64, mem_addr: Option<u64>, regs: GpRegs) {
        let seq = self.state.lock().next_seq();
        let record = ExceptionRecord {
            kind,
            tid,
            pc,
            mem_addr,
            regs,
            seq,
            timestamp: exception::now(),
        };
        let mut sink = self.exception_sink.lock();
        match sink.as_mut() {
            Some(cb) => cb(record),
            None => self.log(LogLevel::Trace, format!("exception dropped, no sink registered: kind={kind:?} tid={tid}")),
        }
    }
}
