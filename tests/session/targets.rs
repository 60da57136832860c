use std::cell::RefCell;
use std::rc::Rc;
use tether::protocol::{status, AttachKind, AttachReply, ProcessDescription, ProcessStatusReply};
use tether::session::error::Error;
use tether::session::observer::ProcessObserver;
use tether::session::process::Process;
use tether::session::target::TargetState;
use tether::session::testing::{connected_session, MockCall};

#[test]
fn attach_creates_process_on_ok() {
    let ts = connected_session();
    let result = Rc::new(RefCell::new(None));
    let slot = result.clone();
    ts.session
        .system()
        .attach_to_process(42, Box::new(move |r| *slot.borrow_mut() = Some(r)));
    ts.drain();

    let mut attaches = ts.mock.take_attach();
    assert_eq!(attaches.len(), 1);
    let (req, cb) = attaches.remove(0);
    assert_eq!(req.kind, AttachKind::Process);
    assert_eq!(req.koid, 42);
    cb(Ok(AttachReply {
        status: status::OK,
        name: "web".into(),
    }));
    ts.drain();

    let process = result.borrow_mut().take().unwrap().unwrap();
    assert_eq!(process.koid(), 42);
    assert_eq!(process.name(), "web");
    assert!(ts.session.system().is_process_attached(42));
}

#[test]
fn second_attach_to_same_koid_sends_nothing() {
    let ts = connected_session();
    ts.session
        .system()
        .attach_to_process(42, Box::new(|_| {}));
    ts.drain();
    let (_, cb) = ts.mock.take_attach().remove(0);
    cb(Ok(AttachReply {
        status: status::OK,
        name: "web".into(),
    }));
    ts.drain();

    let result = Rc::new(RefCell::new(None));
    let slot = result.clone();
    ts.session
        .system()
        .attach_to_process(42, Box::new(move |r| *slot.borrow_mut() = Some(r)));
    ts.drain();

    assert!(matches!(
        result.borrow_mut().take().unwrap(),
        Err(Error::AlreadyAttached(42))
    ));
    assert_eq!(ts.mock.attach_count(), 0, "no second attach request");
}

#[test]
fn already_bound_probe_resolves_benign_race() {
    let ts = connected_session();
    let result = Rc::new(RefCell::new(None));
    let slot = result.clone();
    ts.session
        .system()
        .attach_to_process(7, Box::new(move |r| *slot.borrow_mut() = Some(r)));
    ts.drain();

    let (_, cb) = ts.mock.take_attach().remove(0);
    cb(Ok(AttachReply {
        status: status::ERR_ALREADY_BOUND,
        name: String::new(),
    }));
    ts.drain();

    // the secondary probe decides: a healthy record means success
    let Some(MockCall::ProcessStatus { req, cb }) = ts.mock.pop() else {
        panic!("expected a process status probe");
    };
    assert_eq!(req.process_id, 7);
    cb(Ok(ProcessStatusReply {
        status: status::OK,
        record: ProcessDescription {
            process_id: 7,
            name: "raced".into(),
            components: vec![],
        },
    }));
    ts.drain();

    let process = result.borrow_mut().take().unwrap().unwrap();
    assert_eq!(process.name(), "raced");
}

#[test]
fn already_bound_probe_failure_is_a_conflict() {
    let ts = connected_session();
    let result = Rc::new(RefCell::new(None));
    let slot = result.clone();
    let target = ts.session.system().targets()[0].clone();
    target.attach(7, Box::new(move |r| *slot.borrow_mut() = Some(r)));
    ts.drain();

    let (_, cb) = ts.mock.take_attach().remove(0);
    cb(Ok(AttachReply {
        status: status::ERR_ALREADY_BOUND,
        name: String::new(),
    }));
    ts.drain();
    let Some(MockCall::ProcessStatus { cb, .. }) = ts.mock.pop() else {
        panic!("expected a process status probe");
    };
    cb(Ok(ProcessStatusReply {
        status: status::ERR_NOT_FOUND,
        record: ProcessDescription::default(),
    }));
    ts.drain();

    assert!(matches!(
        result.borrow_mut().take().unwrap(),
        Err(Error::AlreadyAttached(7))
    ));
    assert_eq!(target.state(), TargetState::None, "slot reverted");
}

#[test]
fn launch_io_error_means_binary_not_found() {
    let ts = connected_session();
    let result = Rc::new(RefCell::new(None));
    let slot = result.clone();
    let target = ts.session.system().targets()[0].clone();
    target.launch(
        vec!["/bin/nonexistent".into()],
        Box::new(move |r| *slot.borrow_mut() = Some(r)),
    );
    ts.drain();

    let Some(MockCall::Launch { cb, .. }) = ts.mock.pop() else {
        panic!("expected a launch request");
    };
    cb(Ok(tether::protocol::LaunchReply {
        status: status::ERR_IO,
        process_id: 0,
        process_name: String::new(),
    }));
    ts.drain();

    assert!(matches!(
        result.borrow_mut().take().unwrap(),
        Err(Error::BinaryNotFound)
    ));
    assert_eq!(target.state(), TargetState::None);
}

#[test]
fn generic_status_maps_to_message() {
    let ts = connected_session();
    let result = Rc::new(RefCell::new(None));
    let slot = result.clone();
    let target = ts.session.system().targets()[0].clone();
    target.attach(9, Box::new(move |r| *slot.borrow_mut() = Some(r)));
    ts.drain();

    let (_, cb) = ts.mock.take_attach().remove(0);
    cb(Ok(AttachReply {
        status: -99,
        name: String::new(),
    }));
    ts.drain();

    match result.borrow_mut().take().unwrap() {
        Err(Error::Backend(msg)) => assert!(msg.contains("status=-99"), "got: {msg}"),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("expected a backend error"),
    };
}

#[test]
fn operations_on_busy_target_fail_posted() {
    let ts = connected_session();
    let target = ts.session.system().targets()[0].clone();
    target.attach(1, Box::new(|_| {}));
    ts.drain();

    // while the attach is in flight, a second operation is rejected and
    // nothing extra reaches the agent
    let result = Rc::new(RefCell::new(None));
    let slot = result.clone();
    target.launch(vec!["app".into()], Box::new(move |r| *slot.borrow_mut() = Some(r)));
    assert!(result.borrow().is_none(), "rejection is posted, not inline");
    ts.drain();
    assert!(matches!(
        result.borrow_mut().take().unwrap(),
        Err(Error::TargetAlreadyRunning)
    ));
    assert_eq!(ts.mock.attach_count(), 1);
}

#[test]
fn detach_fires_will_destroy_with_live_process() {
    struct Recorder {
        destroyed: Rc<RefCell<Vec<(u64, usize)>>>,
    }
    impl ProcessObserver for Recorder {
        fn on_will_destroy_process(&self, process: &Rc<Process>) {
            // the process object is still alive during the notification
            self.destroyed
                .borrow_mut()
                .push((process.koid(), process.threads().len()));
        }
    }

    let ts = connected_session();
    let destroyed = Rc::new(RefCell::new(Vec::new()));
    ts.session.observers().add_process(Rc::new(Recorder {
        destroyed: destroyed.clone(),
    }));

    let process = tether::session::testing::spawn_process(&ts, 5, "victim");
    tether::session::testing::spawn_thread(&ts, &process, 6);
    let target = process.target().unwrap();
    drop(process);

    let done = Rc::new(RefCell::new(None));
    let slot = done.clone();
    target.detach(Box::new(move |r| *slot.borrow_mut() = Some(r)));
    ts.drain();
    let Some(MockCall::Detach { cb, .. }) = ts.mock.pop() else {
        panic!("expected a detach request");
    };
    cb(Ok(tether::protocol::DetachReply { status: status::OK }));
    ts.drain();

    assert!(done.borrow_mut().take().unwrap().is_ok());
    assert_eq!(*destroyed.borrow(), vec![(5, 1)]);
    assert_eq!(target.state(), TargetState::None);
}

#[test]
fn last_target_cannot_be_deleted() {
    let ts = connected_session();
    let system = ts.session.system();
    let first = system.targets()[0].clone();
    assert!(matches!(
        system.delete_target(&first),
        Err(Error::LastTarget)
    ));

    let second = system.create_new_target();
    assert!(system.delete_target(&second).is_ok());
    assert!(matches!(
        system.delete_target(&first),
        Err(Error::LastTarget)
    ));
}
