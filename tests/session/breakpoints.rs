use std::rc::Rc;
use tether::protocol::{
    status, AddOrChangeBreakpointReply, BreakpointStats, ExceptionType, NotifyException,
    RemoveBreakpointReply, StackFrame, ThreadRecord, ThreadState,
};
use tether::session::symbols::InputLocation;
use tether::session::testing::{
    connected_session, spawn_process_with_symbols, spawn_thread, TestSession,
};

fn ack_adds(ts: &TestSession) -> usize {
    let adds = ts.mock.take_add_breakpoint();
    let n = adds.len();
    for (_, cb) in adds {
        cb(Ok(AddOrChangeBreakpointReply { status: status::OK }));
    }
    ts.drain();
    n
}

fn ack_removes(ts: &TestSession) -> usize {
    let removes = ts.mock.take_remove_breakpoint();
    let n = removes.len();
    for (_, cb) in removes {
        cb(Ok(RemoveBreakpointReply { status: status::OK }));
    }
    ts.drain();
    n
}

#[test]
fn sync_is_idempotent() {
    let ts = connected_session();
    spawn_process_with_symbols(&ts, 10, "app", &[("frobnicate", 0x5000)]);

    let bp = ts.session.system().create_new_breakpoint();
    let mut settings = bp.settings();
    settings.locations = vec![InputLocation::Symbol("frobnicate".into())];
    bp.set_settings(settings.clone());
    ts.drain();
    assert_eq!(ack_adds(&ts), 1, "first resolution installs");

    // same effective state, any number of times: no further messages
    bp.set_settings(settings.clone());
    bp.set_settings(settings.clone());
    ts.drain();
    assert_eq!(ts.mock.add_breakpoint_count(), 0);
    assert_eq!(ts.mock.remove_breakpoint_count(), 0);

    // disabling uninstalls exactly once
    settings.enabled = false;
    bp.set_settings(settings.clone());
    ts.drain();
    assert_eq!(ack_removes(&ts), 1);

    bp.set_settings(settings);
    ts.drain();
    assert_eq!(ts.mock.remove_breakpoint_count(), 0, "already uninstalled");
}

#[test]
fn changed_locations_resend() {
    let ts = connected_session();
    spawn_process_with_symbols(&ts, 10, "app", &[("alpha", 0x100), ("beta", 0x200)]);

    let bp = ts.session.system().create_new_breakpoint();
    let mut settings = bp.settings();
    settings.locations = vec![InputLocation::Symbol("alpha".into())];
    bp.set_settings(settings.clone());
    ts.drain();
    let adds = ts.mock.take_add_breakpoint();
    assert_eq!(adds.len(), 1);
    assert_eq!(adds[0].0.breakpoint.locations[0].address, 0x100);

    settings.locations = vec![InputLocation::Symbol("beta".into())];
    bp.set_settings(settings);
    ts.drain();
    let adds = ts.mock.take_add_breakpoint();
    assert_eq!(adds.len(), 1, "location change is a real change");
    assert_eq!(adds[0].0.breakpoint.locations[0].address, 0x200);
}

#[test]
fn unresolved_breakpoint_sends_nothing() {
    let ts = connected_session();
    let bp = ts.session.system().create_new_breakpoint();
    let mut settings = bp.settings();
    settings.locations = vec![InputLocation::Symbol("nowhere".into())];
    bp.set_settings(settings);
    ts.drain();
    assert_eq!(ts.mock.add_breakpoint_count(), 0);
    assert_eq!(ts.mock.remove_breakpoint_count(), 0);
}

#[test]
fn module_load_resolves_and_installs_once() {
    let ts = connected_session();
    let process = spawn_process_with_symbols(&ts, 10, "app", &[]);

    let bp = ts.session.system().create_new_breakpoint();
    let mut settings = bp.settings();
    settings.locations = vec![InputLocation::Symbol("late_symbol".into())];
    bp.set_settings(settings);
    ts.drain();
    assert_eq!(ts.mock.add_breakpoint_count(), 0, "symbol not known yet");

    // the module bringing the symbol arrives
    let build_id = "bid-late";
    ts.session.system().symbol_catalog().register(
        build_id,
        tether::session::symbols::SymbolTable::with_functions([("late_symbol".to_string(), 0x7700)]),
    );
    ts.session.dispatch_modules(tether::protocol::NotifyModules {
        process_id: process.koid(),
        modules: vec![tether::protocol::Module {
            name: "late".into(),
            base: 0,
            build_id: build_id.into(),
        }],
        stopped_threads: vec![],
    });
    ts.drain();
    assert_eq!(ack_adds(&ts), 1);

    // a redundant module notification must not spam the agent
    ts.session.dispatch_modules(tether::protocol::NotifyModules {
        process_id: process.koid(),
        modules: process.modules(),
        stopped_threads: vec![],
    });
    ts.drain();
    assert_eq!(ts.mock.add_breakpoint_count(), 0);
}

fn exception_with_hit(
    process: u64,
    thread: u64,
    bp_id: u32,
    hit_count: u32,
    should_delete: bool,
) -> NotifyException {
    NotifyException {
        process_id: process,
        thread: ThreadRecord {
            process_id: process,
            thread_id: thread,
            name: "t".into(),
            state: ThreadState::Blocked,
        },
        r#type: ExceptionType::SoftwareBreakpoint,
        frames: vec![StackFrame {
            ip: 0x1234_5678,
            sp: 0x9000,
            cfa: 0x9010,
        }],
        hit_breakpoints: vec![BreakpointStats {
            id: bp_id,
            hit_count,
            should_delete,
        }],
    }
}

#[test]
fn one_shot_is_torn_down_without_remove_message() {
    let ts = connected_session();
    let process = spawn_process_with_symbols(&ts, 10, "app", &[]);
    spawn_thread(&ts, &process, 11);

    let bp = ts.session.system().create_new_breakpoint();
    let mut settings = bp.settings();
    settings.locations = vec![InputLocation::Address(0x1234_5678)];
    settings.one_shot = true;
    bp.set_settings(settings);
    ts.drain();
    assert_eq!(ack_adds(&ts), 1);

    let weak = Rc::downgrade(&bp);
    let id = bp.id();
    drop(bp);

    ts.session
        .dispatch_exception(exception_with_hit(10, 11, id, 1, true));
    ts.drain();

    assert!(weak.upgrade().is_none(), "breakpoint destroyed");
    assert_eq!(
        ts.mock.remove_breakpoint_count(),
        0,
        "the agent already removed it, no redundant remove"
    );
    assert_eq!(ts.stops.borrow().len(), 1, "the stop itself still surfaced");
}

#[test]
fn off_cycle_conditional_hits_are_suppressed() {
    let ts = connected_session();
    let process = spawn_process_with_symbols(&ts, 10, "app", &[]);
    spawn_thread(&ts, &process, 11);

    let bp = ts.session.system().create_new_breakpoint();
    let mut settings = bp.settings();
    settings.locations = vec![InputLocation::Address(0x1234_5678)];
    settings.hit_mult = 4;
    bp.set_settings(settings);
    ts.drain();
    ack_adds(&ts);
    ts.mock.clear();

    // hits 1..=3 are off the cycle: no observer noise, silent resume
    for hit in 1..=3u32 {
        ts.session
            .dispatch_exception(exception_with_hit(10, 11, bp.id(), hit, false));
        ts.drain();
    }
    assert!(ts.stops.borrow().is_empty(), "no stop notifications");
    assert_eq!(ts.mock.resume_count(), 3, "every suppressed hit resumes");
    assert_eq!(bp.hit_count(), 3);

    // the fourth hit is on the cycle and surfaces normally
    ts.session
        .dispatch_exception(exception_with_hit(10, 11, bp.id(), 4, false));
    ts.drain();
    let stops = ts.stops.borrow();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].1.len(), 1);
}
