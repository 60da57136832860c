//! Test support: a scripted mock agent and session fixtures.
//!
//! The mock records every request as a [`MockCall`] carrying the reply
//! callback, so a test (or harness) decides when and how each request
//! completes. Shipped as a normal module so both unit tests and the
//! integration suites build against the same fixtures.

use crate::protocol::{
    AddOrChangeBreakpointRequest, AddOrChangeBreakpointReply, AttachReply, AttachRequest, Koid,
    Module, ReadMemoryReply, ReadMemoryRequest, ReadRegistersReply, ReadRegistersRequest,
    RemoveBreakpointReply, RemoveBreakpointRequest, ResumeReply, ResumeRequest, ThreadRecord,
    ThreadState, UpdateFilterReply, UpdateFilterRequest,
};
use crate::session::breakpoint::Breakpoint;
use crate::session::observer::ThreadObserver;
use crate::session::process::Process;
use crate::session::remote::{Callback, RemoteApi};
use crate::session::symbols::SymbolTable;
use crate::session::thread::Thread;
use crate::session::Session;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

macro_rules! declare_mock {
    ($( $fn_name:ident => $msg:ident ($req:ty, $rep:ty) ),+ $(,)?) => {
        /// One recorded agent request with its uninvoked reply callback.
        pub enum MockCall {
            $( $msg { req: $req, cb: Callback<$rep> }, )+
        }

        impl std::fmt::Debug for MockCall {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $( MockCall::$msg { .. } => write!(f, stringify!($msg)), )+
                }
            }
        }

        impl RemoteApi for MockRemoteApi {
            $(
                fn $fn_name(&self, req: $req, cb: Callback<$rep>) {
                    self.calls.borrow_mut().push_back(MockCall::$msg { req, cb });
                }
            )+
        }
    };
}

crate::remote_api_methods!(declare_mock);

/// Agent double: records requests, never replies on its own.
#[derive(Default)]
pub struct MockRemoteApi {
    calls: RefCell<VecDeque<MockCall>>,
}

macro_rules! mock_take {
    ($name:ident, $variant:ident, $req:ty, $rep:ty) => {
        /// Extract all recorded calls of this kind, in order, leaving
        /// the rest queued.
        pub fn $name(&self) -> Vec<($req, Callback<$rep>)> {
            let mut taken = Vec::new();
            let mut rest = VecDeque::new();
            for call in self.calls.borrow_mut().drain(..) {
                match call {
                    MockCall::$variant { req, cb } => taken.push((req, cb)),
                    other => rest.push_back(other),
                }
            }
            *self.calls.borrow_mut() = rest;
            taken
        }
    };
}

impl MockRemoteApi {
    pub fn new() -> Rc<MockRemoteApi> {
        Rc::new(MockRemoteApi::default())
    }

    pub fn pop(&self) -> Option<MockCall> {
        self.calls.borrow_mut().pop_front()
    }

    pub fn pending_calls(&self) -> usize {
        self.calls.borrow().len()
    }

    pub fn clear(&self) {
        self.calls.borrow_mut().clear();
    }

    fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.calls.borrow().iter().filter(|c| pred(c)).count()
    }

    pub fn attach_count(&self) -> usize {
        self.count(|c| matches!(c, MockCall::Attach { .. }))
    }

    pub fn resume_count(&self) -> usize {
        self.count(|c| matches!(c, MockCall::Resume { .. }))
    }

    pub fn add_breakpoint_count(&self) -> usize {
        self.count(|c| matches!(c, MockCall::AddOrChangeBreakpoint { .. }))
    }

    pub fn remove_breakpoint_count(&self) -> usize {
        self.count(|c| matches!(c, MockCall::RemoveBreakpoint { .. }))
    }

    /// The most recent resume request, removed from the queue.
    pub fn last_resume(&self) -> Option<(ResumeRequest, Callback<ResumeReply>)> {
        let mut resumes = self.take_resume();
        resumes.pop()
    }

    mock_take!(take_attach, Attach, AttachRequest, AttachReply);
    mock_take!(take_resume, Resume, ResumeRequest, ResumeReply);
    mock_take!(take_read_memory, ReadMemory, ReadMemoryRequest, ReadMemoryReply);
    mock_take!(
        take_read_registers,
        ReadRegisters,
        ReadRegistersRequest,
        ReadRegistersReply
    );
    mock_take!(
        take_update_filter,
        UpdateFilter,
        UpdateFilterRequest,
        UpdateFilterReply
    );
    mock_take!(
        take_add_breakpoint,
        AddOrChangeBreakpoint,
        AddOrChangeBreakpointRequest,
        AddOrChangeBreakpointReply
    );
    mock_take!(
        take_remove_breakpoint,
        RemoveBreakpoint,
        RemoveBreakpointRequest,
        RemoveBreakpointReply
    );
}

/// A session wired to a [`MockRemoteApi`] with recording observers.
pub struct TestSession {
    pub session: Rc<Session>,
    pub mock: Rc<MockRemoteApi>,
    /// (thread koid, visible hit breakpoint ids) per stop notification.
    /// Ids, not references: the recorder must not keep breakpoints alive
    /// past their deletion.
    pub stops: Rc<RefCell<Vec<(Koid, Vec<u32>)>>>,
    /// Count of frames-invalidated notifications.
    pub invalidations: Rc<RefCell<usize>>,
}

struct RecordingThreadObserver {
    stops: Rc<RefCell<Vec<(Koid, Vec<u32>)>>>,
    invalidations: Rc<RefCell<usize>>,
}

impl ThreadObserver for RecordingThreadObserver {
    fn on_thread_stopped(
        &self,
        thread: &Rc<Thread>,
        _exception: crate::protocol::ExceptionType,
        hits: &[Rc<Breakpoint>],
    ) {
        let ids = hits.iter().map(|b| b.id()).collect();
        self.stops.borrow_mut().push((thread.koid(), ids));
    }

    fn on_thread_frames_invalidated(&self, _thread: &Rc<Thread>) {
        *self.invalidations.borrow_mut() += 1;
    }
}

impl TestSession {
    pub fn drain(&self) {
        self.session.queue().drain();
    }
}

/// Session with the mock agent mounted and `did_connect` already run.
pub fn connected_session() -> TestSession {
    let session = Session::new();
    let mock = MockRemoteApi::new();
    session.connect_with_remote(mock.clone());

    let stops = Rc::new(RefCell::new(Vec::new()));
    let invalidations = Rc::new(RefCell::new(0));
    session
        .observers()
        .add_thread(Rc::new(RecordingThreadObserver {
            stops: stops.clone(),
            invalidations: invalidations.clone(),
        }));

    let ts = TestSession {
        session,
        mock,
        stops,
        invalidations,
    };
    ts.drain();
    ts
}

/// Put a running process into a free target slot, as a filter-driven or
/// launch notification would.
pub fn spawn_process(ts: &TestSession, koid: Koid, name: &str) -> Rc<Process> {
    let target = ts.session.system().free_target();
    target.assign_from_agent(koid, name.to_string())
}

/// Same, plus a loaded module whose symbol table carries the given
/// absolute function addresses (module based at zero).
pub fn spawn_process_with_symbols(
    ts: &TestSession,
    koid: Koid,
    name: &str,
    functions: &[(&str, u64)],
) -> Rc<Process> {
    let process = spawn_process(ts, koid, name);
    let build_id = format!("bid-{koid}");
    ts.session.system().symbol_catalog().register(
        &build_id,
        SymbolTable::with_functions(functions.iter().map(|(n, a)| (n.to_string(), *a))),
    );
    process.update_modules(vec![Module {
        name: name.to_string(),
        base: 0,
        build_id,
    }]);
    process
}

/// Register a thread on a process, as a thread-starting notification
/// would.
pub fn spawn_thread(_ts: &TestSession, process: &Rc<Process>, koid: Koid) -> Rc<Thread> {
    process.on_thread_starting(&ThreadRecord {
        process_id: process.koid(),
        thread_id: koid,
        name: format!("thread-{koid}"),
        state: ThreadState::Running,
    })
}
