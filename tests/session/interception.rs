use regex::Regex;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tether::protocol::{
    status, AddOrChangeBreakpointReply, ExceptionType, Koid, NotifyException,
    NotifyProcessExiting, ReadRegistersReply, RegisterValue, StackFrame, ThreadRecord,
    ThreadState,
};
use tether::session::testing::{
    connected_session, spawn_process_with_symbols, spawn_thread, TestSession,
};
use tether::trace::dispatcher::{EventSink, SyscallEvent};
use tether::trace::{InterceptionWorkflow, WorkflowOptions};

#[derive(Default)]
struct RecordingSink {
    events: RefCell<Vec<SyscallEvent>>,
    exceptions: RefCell<Vec<(Koid, Koid, ExceptionType)>>,
    stopped: Cell<bool>,
}

impl EventSink for RecordingSink {
    fn on_syscall(&self, event: &SyscallEvent) {
        self.events.borrow_mut().push(event.clone());
    }
    fn on_exception(&self, process: Koid, thread: Koid, exception: ExceptionType) {
        self.exceptions.borrow_mut().push((process, thread, exception));
    }
    fn on_workflow_stopped(&self) {
        self.stopped.set(true);
    }
}

fn stop_at(process: Koid, thread: Koid, ip: u64, exception: ExceptionType) -> NotifyException {
    NotifyException {
        process_id: process,
        thread: ThreadRecord {
            process_id: process,
            thread_id: thread,
            name: "t".into(),
            state: ThreadState::Blocked,
        },
        r#type: exception,
        frames: vec![StackFrame {
            ip,
            sp: 0x8000,
            cfa: 0x8010,
        }],
        hit_breakpoints: vec![],
    }
}

fn reply_registers(ts: &TestSession, values: &[(&str, u64)]) {
    let reads = ts.mock.take_read_registers();
    assert!(!reads.is_empty(), "expected a register read");
    for (_, cb) in reads {
        cb(Ok(ReadRegistersReply {
            registers: values
                .iter()
                .map(|(name, value)| RegisterValue {
                    name: name.to_string(),
                    value: *value,
                })
                .collect(),
        }));
    }
    ts.drain();
}

fn ack_breakpoint_installs(ts: &TestSession) -> usize {
    let adds = ts.mock.take_add_breakpoint();
    let n = adds.len();
    for (_, cb) in adds {
        cb(Ok(AddOrChangeBreakpointReply { status: status::OK }));
    }
    ts.drain();
    n
}

fn workflow_fixture(
    one_shot: bool,
) -> (TestSession, Rc<InterceptionWorkflow>, Rc<RecordingSink>) {
    let ts = connected_session();
    let sink = Rc::new(RecordingSink::default());
    let workflow = InterceptionWorkflow::new(
        ts.session.clone(),
        sink.clone(),
        WorkflowOptions {
            one_shot_exits: one_shot,
            syscall_filter: Some(Regex::new("^channel_create$").unwrap()),
        },
    );
    workflow.add_main_filter("app");
    ts.drain();
    ts.mock.clear();
    (ts, workflow, sink)
}

#[test]
fn two_phase_entry_exit_protocol() {
    let (ts, workflow, sink) = workflow_fixture(false);

    let process =
        spawn_process_with_symbols(&ts, 10, "app-main", &[("_sys_channel_create", 0x4000)]);
    ts.drain();
    assert!(workflow.decoding(), "main process enables decoding");
    assert_eq!(ack_breakpoint_installs(&ts), 1, "one entry breakpoint");
    spawn_thread(&ts, &process, 11);
    ts.mock.clear();

    // phase one: the entry stub breakpoint fires
    ts.session
        .dispatch_exception(stop_at(10, 11, 0x4000, ExceptionType::SoftwareBreakpoint));
    ts.drain();
    reply_registers(
        &ts,
        &[("a0", 0x7), ("a1", 0x8), ("a2", 0x9), ("ra", 0x9999)],
    );

    // the exit breakpoint goes in at the return address and the thread
    // resumes transparently
    assert_eq!(ack_breakpoint_installs(&ts), 1, "one exit breakpoint");
    assert_eq!(ts.mock.resume_count(), 1);
    assert!(sink.events.borrow().is_empty(), "no event before the exit");
    assert_eq!(ts.stops.borrow().len(), 1, "stop still reached observers");
    ts.mock.clear();

    // phase two: the exit breakpoint fires on the same thread
    ts.session
        .dispatch_exception(stop_at(10, 11, 0x9999, ExceptionType::SoftwareBreakpoint));
    ts.drain();
    reply_registers(&ts, &[("a0", 0)]);

    let events = sink.events.borrow();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].syscall, "channel_create");
    assert_eq!(events[0].args, vec![("options", 0x7), ("out0", 0x8), ("out1", 0x9)]);
    assert_eq!(events[0].return_value, Some(0));
    assert_eq!(ts.mock.resume_count(), 1, "thread resumed after the exit");
}

#[test]
fn shared_exit_breakpoints_are_deduplicated() {
    let (ts, _workflow, _sink) = workflow_fixture(false);
    let process =
        spawn_process_with_symbols(&ts, 10, "app-main", &[("_sys_channel_create", 0x4000)]);
    ts.drain();
    ack_breakpoint_installs(&ts);
    spawn_thread(&ts, &process, 11);
    spawn_thread(&ts, &process, 12);
    ts.mock.clear();

    // two threads enter through the same stub and return to the same
    // address: only one shared exit breakpoint is created
    for tid in [11u64, 12] {
        ts.session
            .dispatch_exception(stop_at(10, tid, 0x4000, ExceptionType::SoftwareBreakpoint));
        ts.drain();
        reply_registers(&ts, &[("a0", 1), ("ra", 0x9999)]);
    }
    assert_eq!(ack_breakpoint_installs(&ts), 1, "second thread reuses it");
}

#[test]
fn one_shot_mode_scopes_exit_breakpoint_to_thread() {
    let (ts, _workflow, _sink) = workflow_fixture(true);
    let process =
        spawn_process_with_symbols(&ts, 10, "app-main", &[("_sys_channel_create", 0x4000)]);
    ts.drain();
    ack_breakpoint_installs(&ts);
    spawn_thread(&ts, &process, 11);
    ts.mock.clear();

    ts.session
        .dispatch_exception(stop_at(10, 11, 0x4000, ExceptionType::SoftwareBreakpoint));
    ts.drain();
    reply_registers(&ts, &[("a0", 1), ("ra", 0x9999)]);

    let adds = ts.mock.take_add_breakpoint();
    assert_eq!(adds.len(), 1);
    let bp = &adds[0].0.breakpoint;
    assert!(bp.one_shot);
    assert_eq!(bp.locations[0].thread_id, 11, "scoped to the thread");
}

#[test]
fn unknown_stop_address_always_continues() {
    let (ts, _workflow, sink) = workflow_fixture(false);
    let process =
        spawn_process_with_symbols(&ts, 10, "app-main", &[("_sys_channel_create", 0x4000)]);
    ts.drain();
    ack_breakpoint_installs(&ts);
    spawn_thread(&ts, &process, 11);
    ts.mock.clear();

    ts.session
        .dispatch_exception(stop_at(10, 11, 0x5555, ExceptionType::SoftwareBreakpoint));
    ts.drain();

    assert_eq!(ts.mock.resume_count(), 1, "never leaves the thread hung");
    assert!(sink.events.borrow().is_empty());
}

#[test]
fn faults_are_reported_once_until_recovery() {
    let (ts, _workflow, sink) = workflow_fixture(false);
    let process =
        spawn_process_with_symbols(&ts, 10, "app-main", &[("_sys_channel_create", 0x4000)]);
    ts.drain();
    ack_breakpoint_installs(&ts);
    spawn_thread(&ts, &process, 11);
    ts.mock.clear();

    ts.session
        .dispatch_exception(stop_at(10, 11, 0x7777, ExceptionType::PageFault));
    ts.drain();
    ts.session
        .dispatch_exception(stop_at(10, 11, 0x7777, ExceptionType::PageFault));
    ts.drain();
    assert_eq!(sink.exceptions.borrow().len(), 1, "duplicate fault muted");

    // a normal stop at a known site clears the error latch
    ts.session
        .dispatch_exception(stop_at(10, 11, 0x4000, ExceptionType::SoftwareBreakpoint));
    ts.drain();
    reply_registers(&ts, &[("a0", 1), ("ra", 0x9999)]);

    ts.session
        .dispatch_exception(stop_at(10, 11, 0x7777, ExceptionType::PageFault));
    ts.drain();
    assert_eq!(sink.exceptions.borrow().len(), 2, "fault reported again");
}

#[test]
fn decoding_is_gated_on_a_main_process() {
    let (ts, workflow, _sink) = workflow_fixture(false);

    // a secondary process first: nothing is installed yet
    spawn_process_with_symbols(&ts, 20, "helper", &[("_sys_channel_create", 0x6000)]);
    ts.drain();
    assert!(!workflow.decoding());
    assert_eq!(ts.mock.add_breakpoint_count(), 0);

    // the main process opens the gate and instrumentation goes into
    // both processes retroactively
    spawn_process_with_symbols(&ts, 21, "app-main", &[("_sys_channel_create", 0x4000)]);
    ts.drain();
    assert!(workflow.decoding());
    assert_eq!(ack_breakpoint_installs(&ts), 2);
}

#[test]
fn workflow_stops_when_last_main_process_dies() {
    let (ts, workflow, sink) = workflow_fixture(false);
    spawn_process_with_symbols(&ts, 10, "app-main", &[("_sys_channel_create", 0x4000)]);
    spawn_process_with_symbols(&ts, 20, "helper", &[("_sys_channel_create", 0x6000)]);
    ts.drain();
    ack_breakpoint_installs(&ts);

    // the secondary going away changes nothing
    ts.session
        .dispatch_process_exiting(NotifyProcessExiting {
            process_id: 20,
            return_code: 0,
        });
    ts.drain();
    assert!(workflow.decoding());
    assert!(!sink.stopped.get());

    // the last main process going away shuts the workflow down
    ts.session
        .dispatch_process_exiting(NotifyProcessExiting {
            process_id: 10,
            return_code: 0,
        });
    ts.drain();
    assert!(!workflow.decoding());
    assert!(sink.stopped.get());
}
