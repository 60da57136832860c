use std::cell::RefCell;
use std::rc::Rc;
use tether::protocol::{IoKind, Module, NotifyIO, NotifyModules};
use tether::session::observer::ProcessObserver;
use tether::session::process::Process;
use tether::session::testing::{connected_session, spawn_process, TestSession};

fn modules_notify(process: u64, stopped: Vec<u64>) -> NotifyModules {
    NotifyModules {
        process_id: process,
        modules: vec![Module {
            name: "app".into(),
            base: 0x1000,
            build_id: "bid".into(),
        }],
        stopped_threads: stopped,
    }
}

fn resumed_thread_ids(ts: &TestSession) -> Vec<Vec<u64>> {
    ts.mock
        .take_resume()
        .into_iter()
        .map(|(req, _)| req.thread_ids)
        .collect()
}

#[test]
fn module_load_resumes_stopped_threads() {
    let ts = connected_session();
    let process = spawn_process(&ts, 10, "app");
    ts.session.dispatch_modules(modules_notify(process.koid(), vec![11]));
    ts.drain();
    assert_eq!(resumed_thread_ids(&ts), vec![vec![11]]);
}

#[test]
fn pause_on_launch_holds_a_single_stopped_thread() {
    let ts = connected_session();
    ts.session.system().settings().pause_on_launch.set(true);
    let process = spawn_process(&ts, 10, "app");

    ts.session.dispatch_modules(modules_notify(process.koid(), vec![11]));
    ts.drain();
    assert!(resumed_thread_ids(&ts).is_empty(), "the lone thread stays paused");
}

#[test]
fn pause_on_launch_does_not_apply_to_multiple_stopped_threads() {
    // only the single-stopped-thread launch consults the setting;
    // multi-thread loads resume everything reported
    let ts = connected_session();
    ts.session.system().settings().pause_on_launch.set(true);
    let process = spawn_process(&ts, 10, "app");

    ts.session
        .dispatch_modules(modules_notify(process.koid(), vec![11, 12]));
    ts.drain();
    assert_eq!(resumed_thread_ids(&ts), vec![vec![11, 12]]);
}

#[test]
fn module_load_notifies_process_observers() {
    struct Recorder {
        loads: Rc<RefCell<Vec<(u64, usize)>>>,
    }
    impl ProcessObserver for Recorder {
        fn on_modules_loaded(&self, process: &Rc<Process>) {
            self.loads
                .borrow_mut()
                .push((process.koid(), process.modules().len()));
        }
    }

    let ts = connected_session();
    let loads = Rc::new(RefCell::new(Vec::new()));
    ts.session
        .observers()
        .add_process(Rc::new(Recorder { loads: loads.clone() }));

    let process = spawn_process(&ts, 10, "app");
    ts.session.dispatch_modules(modules_notify(process.koid(), vec![]));
    ts.drain();
    assert_eq!(*loads.borrow(), vec![(10, 1)]);
}

#[test]
fn io_notifications_buffer_and_fan_out() {
    struct IoRecorder {
        chunks: Rc<RefCell<Vec<(IoKind, Vec<u8>)>>>,
    }
    impl ProcessObserver for IoRecorder {
        fn on_io(&self, _process: &Rc<Process>, kind: IoKind, data: &[u8]) {
            self.chunks.borrow_mut().push((kind, data.to_vec()));
        }
    }

    let ts = connected_session();
    let chunks = Rc::new(RefCell::new(Vec::new()));
    ts.session
        .observers()
        .add_process(Rc::new(IoRecorder { chunks: chunks.clone() }));

    let process = spawn_process(&ts, 10, "app");
    ts.session.dispatch_io(NotifyIO {
        process_id: 10,
        kind: IoKind::Stdout,
        data: b"hello".to_vec(),
    });
    ts.session.dispatch_io(NotifyIO {
        process_id: 10,
        kind: IoKind::Stderr,
        data: b"oops".to_vec(),
    });
    ts.drain();

    assert_eq!(process.stdout(), b"hello");
    assert_eq!(process.stderr(), b"oops");
    assert_eq!(chunks.borrow().len(), 2);
}
