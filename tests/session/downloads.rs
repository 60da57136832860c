use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;
use tether::session::observer::SystemObserver;
use tether::session::symbols::{
    DebugFileType, FetchFn, SymbolServer, SymbolServerState,
};
use tether::session::testing::connected_session;

/// Scripted server: answers every check through the posted path,
/// according to `behavior`.
struct ScriptedServer {
    name: String,
    state: SymbolServerState,
    behavior: Behavior,
    queue: tether::session::exec::EventQueue,
    checks: Rc<Cell<usize>>,
}

#[derive(Clone, Copy)]
enum Behavior {
    No,
    Yes,
    YesButFail,
}

impl ScriptedServer {
    fn new(
        name: &str,
        behavior: Behavior,
        queue: tether::session::exec::EventQueue,
    ) -> Rc<Self> {
        Rc::new(Self {
            name: name.to_string(),
            state: SymbolServerState::Ready,
            behavior,
            queue,
            checks: Rc::new(Cell::new(0)),
        })
    }
}

impl SymbolServer for ScriptedServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> SymbolServerState {
        self.state
    }

    fn check_fetch(
        &self,
        build_id: &str,
        _file_type: DebugFileType,
        cb: Box<dyn FnOnce(Option<FetchFn>)>,
    ) {
        self.checks.set(self.checks.get() + 1);
        let behavior = self.behavior;
        let build_id = build_id.to_string();
        let queue = self.queue.clone();
        let fetch_queue = queue.clone();
        queue.post(move || match behavior {
            Behavior::No => cb(None),
            Behavior::Yes => {
                let path = PathBuf::from(format!("/cache/{build_id}.debug"));
                cb(Some(Box::new(move |done| {
                    fetch_queue.post(move || done(Ok(path)));
                })));
            }
            Behavior::YesButFail => {
                cb(Some(Box::new(move |done| {
                    fetch_queue.post(move || done(Err("transfer aborted".into())));
                })));
            }
        });
    }
}

struct EdgeRecorder {
    started: Rc<Cell<usize>>,
    stopped: Rc<RefCell<Vec<(usize, usize)>>>,
}

impl SystemObserver for EdgeRecorder {
    fn on_downloads_started(&self) {
        self.started.set(self.started.get() + 1);
    }
    fn on_downloads_stopped(&self, success: usize, fail: usize) {
        self.stopped.borrow_mut().push((success, fail));
    }
}

#[test]
fn concurrent_requests_share_one_transfer() {
    let ts = connected_session();
    let server = ScriptedServer::new("primary", Behavior::Yes, ts.session.queue().clone());
    ts.session.system().add_symbol_server(server.clone());

    let results = Rc::new(RefCell::new(Vec::new()));
    let first = ts
        .session
        .system()
        .get_download("abc123", DebugFileType::DebugInfo);
    let second = ts
        .session
        .system()
        .get_download("abc123", DebugFileType::DebugInfo);
    assert!(Rc::ptr_eq(&first, &second), "same in-flight transfer");

    for _ in 0..2 {
        let results = results.clone();
        ts.session.system().request_download(
            "abc123",
            DebugFileType::DebugInfo,
            Box::new(move |r| results.borrow_mut().push(r.map_err(|e| e.to_string()))),
        );
    }
    drop((first, second));
    ts.drain();

    assert_eq!(server.checks.get(), 1, "one check for one key");
    let results = results.borrow();
    assert_eq!(results.len(), 2, "both callbacks fired exactly once");
    for r in results.iter() {
        assert_eq!(
            r.as_ref().unwrap(),
            &PathBuf::from("/cache/abc123.debug")
        );
    }
}

#[test]
fn distinct_file_types_are_distinct_downloads() {
    let ts = connected_session();
    let server = ScriptedServer::new("primary", Behavior::Yes, ts.session.queue().clone());
    ts.session.system().add_symbol_server(server.clone());

    let a = ts
        .session
        .system()
        .get_download("abc123", DebugFileType::DebugInfo);
    let b = ts
        .session
        .system()
        .get_download("abc123", DebugFileType::Binary);
    assert!(!Rc::ptr_eq(&a, &b));
}

#[test]
fn failed_transfer_falls_back_to_next_server() {
    let ts = connected_session();
    ts.session
        .system()
        .add_symbol_server(ScriptedServer::new("flaky", Behavior::YesButFail, ts.session.queue().clone()));
    ts.session
        .system()
        .add_symbol_server(ScriptedServer::new("good", Behavior::Yes, ts.session.queue().clone()));

    let result = Rc::new(RefCell::new(None));
    let slot = result.clone();
    ts.session.system().request_download(
        "deadbeef",
        DebugFileType::DebugInfo,
        Box::new(move |r| *slot.borrow_mut() = Some(r)),
    );
    ts.drain();

    let r = result.borrow_mut().take().expect("completed");
    assert_eq!(r.unwrap(), PathBuf::from("/cache/deadbeef.debug"));
}

#[test]
fn all_servers_decline_reports_failure_once() {
    let ts = connected_session();
    ts.session
        .system()
        .add_symbol_server(ScriptedServer::new("a", Behavior::No, ts.session.queue().clone()));
    ts.session
        .system()
        .add_symbol_server(ScriptedServer::new("b", Behavior::No, ts.session.queue().clone()));

    let fired = Rc::new(Cell::new(0));
    let counter = fired.clone();
    ts.session.system().request_download(
        "missing",
        DebugFileType::DebugInfo,
        Box::new(move |r| {
            assert!(r.is_err());
            counter.set(counter.get() + 1);
        }),
    );
    ts.drain();
    assert_eq!(fired.get(), 1);
}

#[test]
fn aggregate_events_fire_on_edges_only() {
    let ts = connected_session();
    ts.session
        .system()
        .add_symbol_server(ScriptedServer::new("good", Behavior::Yes, ts.session.queue().clone()));
    ts.session
        .system()
        .add_symbol_server(ScriptedServer::new("empty", Behavior::No, ts.session.queue().clone()));

    let started = Rc::new(Cell::new(0));
    let stopped = Rc::new(RefCell::new(Vec::new()));
    ts.session.observers().add_system(Rc::new(EdgeRecorder {
        started: started.clone(),
        stopped: stopped.clone(),
    }));

    // two overlapping downloads, both served by "good"
    ts.session.system().request_download(
        "one",
        DebugFileType::DebugInfo,
        Box::new(|_| {}),
    );
    ts.session.system().request_download(
        "two",
        DebugFileType::DebugInfo,
        Box::new(|_| {}),
    );
    ts.drain();

    assert_eq!(started.get(), 1, "started only on the 0 -> 1 edge");
    assert_eq!(*stopped.borrow(), vec![(2, 0)], "stopped once with totals");
}
