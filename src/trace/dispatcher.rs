//! Decoded-event side of the interception workflow: per-invocation
//! decoders, the dispatcher that turns them into sink events, and the
//! sink trait front ends implement.

use crate::protocol::{ExceptionType, Koid};
use crate::trace::syscalls::SyscallDescriptor;
use itertools::Itertools;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// One fully or partially decoded syscall invocation.
#[derive(Debug, Clone)]
pub struct SyscallEvent {
    pub process: Koid,
    pub thread: Koid,
    pub syscall: &'static str,
    pub args: Vec<(&'static str, u64)>,
    /// Present once the exit breakpoint reported back; `None` for
    /// fire-and-forget syscalls and entry-only events.
    pub return_value: Option<u64>,
}

/// Where decoded events go (console printer, test recorder).
pub trait EventSink {
    fn on_syscall(&self, event: &SyscallEvent);
    fn on_exception(&self, process: Koid, thread: Koid, exception: ExceptionType) {
        let _ = (process, thread, exception);
    }
    /// The workflow ran out of main processes and shut down.
    fn on_workflow_stopped(&self) {}
}

/// Decoding state for one in-flight syscall on one thread: arguments
/// captured at entry, waiting for the return value.
pub struct SyscallDecoder {
    pub process: Koid,
    pub thread: Koid,
    pub descriptor: &'static SyscallDescriptor,
    args: RefCell<Vec<(&'static str, u64)>>,
    return_address: Cell<u64>,
}

impl SyscallDecoder {
    pub fn new(process: Koid, thread: Koid, descriptor: &'static SyscallDescriptor) -> Rc<Self> {
        Rc::new(Self {
            process,
            thread,
            descriptor,
            args: RefCell::new(Vec::new()),
            return_address: Cell::new(0),
        })
    }

    pub fn set_args(&self, args: Vec<(&'static str, u64)>) {
        *self.args.borrow_mut() = args;
    }

    pub fn set_return_address(&self, address: u64) {
        self.return_address.set(address);
    }

    pub fn return_address(&self) -> u64 {
        self.return_address.get()
    }

    fn event(&self, return_value: Option<u64>) -> SyscallEvent {
        SyscallEvent {
            process: self.process,
            thread: self.thread,
            syscall: self.descriptor.name,
            args: self.args.borrow().clone(),
            return_value,
        }
    }
}

/// Fans decoded syscalls and faults out to the sink and keeps counters.
pub struct SyscallDecoderDispatcher {
    sink: Rc<dyn EventSink>,
    syscalls_decoded: Cell<usize>,
    exceptions_decoded: Cell<usize>,
}

impl SyscallDecoderDispatcher {
    pub fn new(sink: Rc<dyn EventSink>) -> Rc<Self> {
        Rc::new(Self {
            sink,
            syscalls_decoded: Cell::new(0),
            exceptions_decoded: Cell::new(0),
        })
    }

    pub fn syscalls_decoded(&self) -> usize {
        self.syscalls_decoded.get()
    }

    pub fn exceptions_decoded(&self) -> usize {
        self.exceptions_decoded.get()
    }

    /// Entry decoded for a fire-and-forget syscall, or one whose exit
    /// will not be observed.
    pub fn on_syscall_entry(&self, decoder: &SyscallDecoder) {
        self.syscalls_decoded.set(self.syscalls_decoded.get() + 1);
        self.sink.on_syscall(&decoder.event(None));
    }

    /// Exit breakpoint reported the return value, the invocation is
    /// complete.
    pub fn on_syscall_exit(&self, decoder: &SyscallDecoder, return_value: u64) {
        self.syscalls_decoded.set(self.syscalls_decoded.get() + 1);
        self.sink.on_syscall(&decoder.event(Some(return_value)));
    }

    /// A fault on an intercepted thread.
    pub fn decode_exception(&self, process: Koid, thread: Koid, exception: ExceptionType) {
        self.exceptions_decoded.set(self.exceptions_decoded.get() + 1);
        self.sink.on_exception(process, thread, exception);
    }

    pub fn workflow_stopped(&self) {
        self.sink.on_workflow_stopped();
    }
}

/// Sink that renders events through the logging facade; the trace tool
/// uses it for plain console output.
pub struct LogSink;

impl EventSink for LogSink {
    fn on_syscall(&self, event: &SyscallEvent) {
        let args = event
            .args
            .iter()
            .map(|(name, value)| format!("{name}={value:#x}"))
            .join(", ");
        match event.return_value {
            Some(ret) => log::info!(
                target: "intercept",
                "{}:{} {}({args}) -> {ret:#x}",
                event.process,
                event.thread,
                event.syscall
            ),
            None => log::info!(
                target: "intercept",
                "{}:{} {}({args})",
                event.process,
                event.thread,
                event.syscall
            ),
        }
    }

    fn on_exception(&self, process: Koid, thread: Koid, exception: ExceptionType) {
        log::warn!(target: "intercept", "{process}:{thread} fault: {exception}");
    }

    fn on_workflow_stopped(&self) {
        log::info!(target: "intercept", "no main process left, interception stopped");
    }
}
