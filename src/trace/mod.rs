//! Syscall interception: a workflow that plants breakpoints on syscall
//! entry stubs and runs a two-phase protocol per invocation (entry
//! breakpoint captures arguments, an exit breakpoint at the return
//! address captures the result), feeding a
//! [`SyscallDecoderDispatcher`].

pub mod dispatcher;
pub mod syscalls;

use crate::protocol::{regs, ExceptionType, Koid, ReadRegistersRequest};
use crate::session::breakpoint::{Breakpoint, BreakpointScope};
use crate::session::filter::FilterType;
use crate::session::observer::{ProcessObserver, ThreadObserver};
use crate::session::process::Process;
use crate::session::symbols::InputLocation;
use crate::session::thread::Thread;
use crate::session::Session;
use crate::trace::dispatcher::{EventSink, SyscallDecoder, SyscallDecoderDispatcher};
use crate::trace::syscalls::SyscallDescriptor;
use regex::Regex;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

#[derive(Default)]
pub struct WorkflowOptions {
    /// Thread-scoped one-shot exit breakpoints instead of shared
    /// address-scoped ones.
    pub one_shot_exits: bool,
    /// Restrict interception to syscalls whose name matches.
    pub syscall_filter: Option<Regex>,
}

/// Two-phase protocol state for one thread. Absence of an exit record
/// and `AwaitingEntry` mean the same thing; keeping the variant makes
/// the phase explicit and an overlapping in-flight syscall detectable
/// instead of silently overwritten.
enum ThreadSyscallState {
    AwaitingEntry,
    AwaitingExit(Rc<SyscallDecoder>),
}

struct ProcessConfig {
    is_main: bool,
    breakpoints_installed: bool,
}

pub struct InterceptionWorkflow {
    me: Weak<InterceptionWorkflow>,
    session: Rc<Session>,
    dispatcher: Rc<SyscallDecoderDispatcher>,
    options: WorkflowOptions,
    selected: Vec<&'static SyscallDescriptor>,
    /// Substring patterns naming main processes; decoding is gated on at
    /// least one of them being alive.
    main_patterns: RefCell<Vec<String>>,
    /// (process, entry stub address) -> descriptor.
    entry_sites: RefCell<HashMap<(Koid, u64), &'static SyscallDescriptor>>,
    /// Entry breakpoints per process, for teardown.
    entry_breakpoints: RefCell<HashMap<Koid, Vec<Rc<Breakpoint>>>>,
    /// Shared exit breakpoints keyed by (process, return address);
    /// unused in one-shot mode.
    exit_breakpoints: RefCell<HashMap<(Koid, u64), Rc<Breakpoint>>>,
    syscall_states: RefCell<HashMap<Koid, ThreadSyscallState>>,
    /// Threads whose fault was already reported; cleared when the thread
    /// next stops at a known site.
    threads_in_error: RefCell<HashSet<Koid>>,
    /// Syscall decoding stays off until a main process starts.
    decode_events: Cell<bool>,
    processes: RefCell<HashMap<Koid, ProcessConfig>>,
}

struct WorkflowObserver {
    workflow: Weak<InterceptionWorkflow>,
}

impl ProcessObserver for WorkflowObserver {
    fn on_process_created(&self, process: &Rc<Process>) {
        if let Some(wf) = self.workflow.upgrade() {
            wf.configure_process(process);
        }
    }

    fn on_will_destroy_process(&self, process: &Rc<Process>) {
        if let Some(wf) = self.workflow.upgrade() {
            wf.process_gone(process);
        }
    }

    fn on_modules_loaded(&self, process: &Rc<Process>) {
        if let Some(wf) = self.workflow.upgrade() {
            if wf.decode_events.get() {
                wf.try_install(process);
            }
        }
    }
}

impl ThreadObserver for WorkflowObserver {
    fn on_thread_stopped(
        &self,
        thread: &Rc<Thread>,
        exception: ExceptionType,
        hits: &[Rc<Breakpoint>],
    ) {
        if let Some(wf) = self.workflow.upgrade() {
            wf.on_thread_stopped(thread, exception, hits);
        }
    }
}

impl InterceptionWorkflow {
    pub fn new(
        session: Rc<Session>,
        sink: Rc<dyn EventSink>,
        options: WorkflowOptions,
    ) -> Rc<InterceptionWorkflow> {
        let selected = syscalls::matching(options.syscall_filter.as_ref());
        let workflow = Rc::new_cyclic(|me| InterceptionWorkflow {
            me: me.clone(),
            session: session.clone(),
            dispatcher: SyscallDecoderDispatcher::new(sink),
            options,
            selected,
            main_patterns: RefCell::default(),
            entry_sites: RefCell::default(),
            entry_breakpoints: RefCell::default(),
            exit_breakpoints: RefCell::default(),
            syscall_states: RefCell::default(),
            threads_in_error: RefCell::default(),
            decode_events: Cell::new(false),
            processes: RefCell::default(),
        });
        let observer = Rc::new(WorkflowObserver {
            workflow: Rc::downgrade(&workflow),
        });
        session.observers().add_process(observer.clone());
        session.observers().add_thread(observer);
        workflow
    }

    pub fn dispatcher(&self) -> &Rc<SyscallDecoderDispatcher> {
        &self.dispatcher
    }

    pub fn decoding(&self) -> bool {
        self.decode_events.get()
    }

    // ------------------------------ filters ---------------------------------------------------

    /// Add a process filter whose matches are main processes: the first
    /// one to start enables decoding for everyone.
    pub fn add_main_filter(&self, pattern: &str) {
        self.main_patterns.borrow_mut().push(pattern.to_string());
        self.install_filter(pattern);
    }

    /// Secondary processes are intercepted too, but only once a main
    /// process is alive.
    pub fn add_secondary_filter(&self, pattern: &str) {
        self.install_filter(pattern);
    }

    fn install_filter(&self, pattern: &str) {
        let filter = self.session.system().create_new_filter();
        filter.set_type(FilterType::ProcessNameSubstr);
        filter.set_pattern(pattern);
    }

    // ------------------------------ process gating --------------------------------------------

    fn configure_process(&self, process: &Rc<Process>) {
        let is_main = self
            .main_patterns
            .borrow()
            .iter()
            .any(|p| process.name().contains(p.as_str()));
        self.processes.borrow_mut().insert(
            process.koid(),
            ProcessConfig {
                is_main,
                breakpoints_installed: false,
            },
        );

        if is_main && !self.decode_events.get() {
            log::info!(
                target: "intercept",
                "main process {} ({}) started, decoding enabled",
                process.name(),
                process.koid()
            );
            self.decode_events.set(true);
            // catch up on processes configured before the gate opened
            for other in self.session.system().all_processes() {
                self.try_install(&other);
            }
        } else if self.decode_events.get() {
            self.try_install(process);
        }
    }

    /// Plant entry breakpoints for every selected syscall the process
    /// symbols can resolve. A process without its modules yet stays
    /// uninstalled; the modules-loaded notification retries.
    fn try_install(&self, process: &Rc<Process>) {
        {
            let procs = self.processes.borrow();
            match procs.get(&process.koid()) {
                Some(config) if !config.breakpoints_installed => {}
                _ => return,
            }
        }
        let Some(target) = process.target() else { return };

        let symbols = process.symbols();
        let mut planted = Vec::new();
        for descriptor in &self.selected {
            let Some(address) = symbols.symbol_address(&descriptor.entry_symbol()) else {
                continue;
            };
            self.entry_sites
                .borrow_mut()
                .insert((process.koid(), address), descriptor);

            let bp = self.session.system().create_new_internal_breakpoint();
            let mut settings = bp.settings();
            settings.scope = BreakpointScope::Target(Rc::downgrade(&target));
            settings.locations = vec![InputLocation::Address(address)];
            bp.set_settings(settings);
            planted.push(bp);
        }
        if planted.is_empty() {
            return;
        }
        log::debug!(
            target: "intercept",
            "installed {} syscall breakpoints in process {}",
            planted.len(),
            process.koid()
        );
        self.entry_breakpoints
            .borrow_mut()
            .entry(process.koid())
            .or_default()
            .extend(planted);
        if let Some(config) = self.processes.borrow_mut().get_mut(&process.koid()) {
            config.breakpoints_installed = true;
        }
    }

    fn process_gone(&self, process: &Rc<Process>) {
        let koid = process.koid();
        let removed = self.processes.borrow_mut().remove(&koid);
        for bp in self
            .entry_breakpoints
            .borrow_mut()
            .remove(&koid)
            .unwrap_or_default()
        {
            self.session.system().delete_breakpoint_quiet(&bp);
        }
        let stale_exits: Vec<_> = {
            let mut exits = self.exit_breakpoints.borrow_mut();
            let keys: Vec<_> = exits.keys().filter(|(p, _)| *p == koid).copied().collect();
            keys.into_iter().filter_map(|k| exits.remove(&k)).collect()
        };
        for bp in stale_exits {
            self.session.system().delete_breakpoint_quiet(&bp);
        }
        self.entry_sites.borrow_mut().retain(|(p, _), _| *p != koid);
        self.syscall_states.borrow_mut().retain(|_, state| match state {
            ThreadSyscallState::AwaitingExit(decoder) => decoder.process != koid,
            ThreadSyscallState::AwaitingEntry => true,
        });

        // the workflow only winds down once no main process remains
        if removed.map_or(false, |c| c.is_main)
            && !self.processes.borrow().values().any(|c| c.is_main)
        {
            self.shutdown();
        }
    }

    /// Stop decoding and remove all instrumentation.
    pub fn shutdown(&self) {
        if !self.decode_events.replace(false) {
            return;
        }
        log::info!(target: "intercept", "shutting down interception");
        for (_, bps) in self.entry_breakpoints.borrow_mut().drain() {
            for bp in bps {
                self.session.system().delete_breakpoint_quiet(&bp);
            }
        }
        for (_, bp) in self.exit_breakpoints.borrow_mut().drain() {
            self.session.system().delete_breakpoint_quiet(&bp);
        }
        self.entry_sites.borrow_mut().clear();
        self.syscall_states.borrow_mut().clear();
        self.dispatcher.workflow_stopped();
    }

    // ------------------------------ stop handling ---------------------------------------------

    fn on_thread_stopped(
        &self,
        thread: &Rc<Thread>,
        exception: ExceptionType,
        hits: &[Rc<Breakpoint>],
    ) {
        if !self.decode_events.get() {
            return;
        }
        let tid = thread.koid();
        let pkoid = thread.process_koid();
        let Some(ip) = thread.top_ip() else {
            thread.continue_(false);
            return;
        };

        // exit phase: the thread returned from a decoded syscall
        let exit_decoder = match self.syscall_states.borrow().get(&tid) {
            Some(ThreadSyscallState::AwaitingExit(decoder)) if decoder.return_address() == ip => {
                Some(decoder.clone())
            }
            _ => None,
        };
        if let Some(decoder) = exit_decoder {
            self.syscall_states
                .borrow_mut()
                .insert(tid, ThreadSyscallState::AwaitingEntry);
            self.threads_in_error.borrow_mut().remove(&tid);
            self.load_return_value(thread, decoder);
            return;
        }

        // entry phase: one of our stub breakpoints
        let descriptor = self.entry_sites.borrow().get(&(pkoid, ip)).copied();
        if let Some(descriptor) = descriptor {
            self.threads_in_error.borrow_mut().remove(&tid);
            if matches!(
                self.syscall_states.borrow().get(&tid),
                Some(ThreadSyscallState::AwaitingExit(_))
            ) {
                // the previous invocation never reported back (tail
                // call or missed exit); its decoder is abandoned
                log::error!(
                    target: "intercept",
                    "thread {tid}: overlapping in-flight syscall, dropping previous decoder"
                );
            }
            self.decode_entry(thread, descriptor);
            return;
        }

        if !exception.is_debug() {
            // a fault; report it once until the thread recovers
            if self.threads_in_error.borrow_mut().insert(tid) {
                self.dispatcher.decode_exception(pkoid, tid, exception);
            }
            thread.continue_(false);
            return;
        }

        if hits.is_empty() {
            // a breakpoint-class stop at an address we never configured:
            // an internal bookkeeping error, never leave the thread hung
            log::error!(
                target: "intercept",
                "thread {tid}: stop at unconfigured address {ip:#x}, continuing"
            );
            thread.continue_(false);
        }
        // stops with user breakpoints belong to the embedding front end
    }

    fn decode_entry(&self, thread: &Rc<Thread>, descriptor: &'static SyscallDescriptor) {
        let decoder = SyscallDecoder::new(thread.process_koid(), thread.koid(), descriptor);
        let me = self.me.clone();
        let thread_weak = Rc::downgrade(thread);
        self.session.remote().read_registers(
            ReadRegistersRequest {
                process_id: thread.process_koid(),
                thread_id: thread.koid(),
            },
            Box::new(move |result| {
                let (Some(wf), Some(thread)) = (me.upgrade(), thread_weak.upgrade()) else {
                    return;
                };
                let registers = match result {
                    Ok(reply) => reg_map(reply.registers),
                    Err(e) => {
                        log::warn!(target: "intercept", "register read failed: {e:#}");
                        thread.continue_(false);
                        return;
                    }
                };
                let args = descriptor
                    .args
                    .iter()
                    .enumerate()
                    .map(|(i, arg)| {
                        (arg.name, registers.get(&regs::arg(i)).copied().unwrap_or(0))
                    })
                    .collect();
                decoder.set_args(args);

                if !descriptor.returns_value {
                    wf.dispatcher.on_syscall_entry(&decoder);
                    thread.continue_(false);
                    return;
                }
                let Some(&return_address) = registers.get(regs::RA) else {
                    log::error!(
                        target: "intercept",
                        "no return address register, emitting entry only"
                    );
                    wf.dispatcher.on_syscall_entry(&decoder);
                    thread.continue_(false);
                    return;
                };
                decoder.set_return_address(return_address);
                wf.add_exit_breakpoint(&thread, return_address);
                wf.syscall_states
                    .borrow_mut()
                    .insert(thread.koid(), ThreadSyscallState::AwaitingExit(decoder));
                thread.continue_(false);
            }),
        );
    }

    /// Exit breakpoint at the syscall return site. One-shot mode scopes
    /// it to the thread and lets the agent remove it after the hit;
    /// otherwise one shared address-scoped breakpoint serves every
    /// thread of the process and is reused across invocations.
    fn add_exit_breakpoint(&self, thread: &Rc<Thread>, address: u64) {
        if self.options.one_shot_exits {
            let bp = self.session.system().create_new_internal_breakpoint();
            let mut settings = bp.settings();
            settings.scope = BreakpointScope::Thread(Rc::downgrade(thread));
            settings.locations = vec![InputLocation::Address(address)];
            settings.one_shot = true;
            bp.set_settings(settings);
            return;
        }

        let key = (thread.process_koid(), address);
        if self.exit_breakpoints.borrow().contains_key(&key) {
            return;
        }
        let Some(target) = thread.process().and_then(|p| p.target()) else {
            return;
        };
        let bp = self.session.system().create_new_internal_breakpoint();
        let mut settings = bp.settings();
        settings.scope = BreakpointScope::Target(Rc::downgrade(&target));
        settings.locations = vec![InputLocation::Address(address)];
        bp.set_settings(settings);
        self.exit_breakpoints.borrow_mut().insert(key, bp);
    }

    fn load_return_value(&self, thread: &Rc<Thread>, decoder: Rc<SyscallDecoder>) {
        let me = self.me.clone();
        let thread_weak = Rc::downgrade(thread);
        self.session.remote().read_registers(
            ReadRegistersRequest {
                process_id: thread.process_koid(),
                thread_id: thread.koid(),
            },
            Box::new(move |result| {
                let (Some(wf), Some(thread)) = (me.upgrade(), thread_weak.upgrade()) else {
                    return;
                };
                match result {
                    Ok(reply) => {
                        // the first argument register doubles as the
                        // return value register
                        let ret = reg_map(reply.registers)
                            .get(&regs::arg(0))
                            .copied()
                            .unwrap_or(0);
                        wf.dispatcher.on_syscall_exit(&decoder, ret);
                    }
                    Err(e) => {
                        log::warn!(target: "intercept", "return value read failed: {e:#}");
                    }
                }
                thread.continue_(false);
            }),
        );
    }
}

fn reg_map(registers: Vec<crate::protocol::RegisterValue>) -> HashMap<String, u64> {
    registers.into_iter().map(|r| (r.name, r.value)).collect()
}
