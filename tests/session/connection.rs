use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::rc::Rc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tether::protocol::codec::{self, Header, HEADER_SIZE, MAX_MESSAGE_SIZE};
use tether::protocol::{Arch, HelloReply, MsgType, HELLO_MAGIC, PROTOCOL_VERSION};
use tether::session::error::Error;
use tether::session::observer::SessionObserver;
use tether::session::{Session, SessionState};

/// Scripted agent side of one connection.
fn spawn_agent(
    script: impl FnOnce(TcpStream) + Send + 'static,
) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let handle = std::thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        script(stream);
    });
    (addr, handle)
}

fn read_frame(stream: &mut TcpStream) -> (Header, Vec<u8>) {
    let mut header_buf = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header_buf).expect("read header");
    let header = Header::parse(&header_buf).expect("parse header");
    let mut body = vec![0u8; header.size as usize];
    stream.read_exact(&mut body).expect("read body");
    (header, body)
}

fn write_hello_reply(stream: &mut TcpStream, transaction_id: u32, version: u32) {
    let frame = codec::encode(
        MsgType::Hello,
        transaction_id,
        &HelloReply {
            magic: HELLO_MAGIC,
            version,
            arch: Arch::X64,
            page_size: 4096,
        },
    )
    .expect("encode hello");
    stream.write_all(&frame).expect("write hello");
}

fn poll_until(session: &Session, deadline: Duration, done: impl Fn() -> bool) {
    let start = Instant::now();
    while !done() {
        assert!(start.elapsed() < deadline, "timed out waiting for session");
        session.poll_wire(Duration::from_millis(50));
    }
}

struct ErrorRecorder {
    errors: Rc<RefCell<Vec<String>>>,
    warnings: Rc<RefCell<Vec<String>>>,
    disconnects: Rc<Cell<usize>>,
}

impl SessionObserver for ErrorRecorder {
    fn on_session_error(&self, err: &Error) {
        self.errors.borrow_mut().push(err.to_string());
    }
    fn on_session_warning(&self, msg: &str) {
        self.warnings.borrow_mut().push(msg.to_string());
    }
    fn on_disconnected(&self) {
        self.disconnects.set(self.disconnects.get() + 1);
    }
}

fn recorder(session: &Session) -> (Rc<RefCell<Vec<String>>>, Rc<RefCell<Vec<String>>>, Rc<Cell<usize>>) {
    let errors = Rc::new(RefCell::new(Vec::new()));
    let warnings = Rc::new(RefCell::new(Vec::new()));
    let disconnects = Rc::new(Cell::new(0));
    session.observers().add_session(Rc::new(ErrorRecorder {
        errors: errors.clone(),
        warnings: warnings.clone(),
        disconnects: disconnects.clone(),
    }));
    (errors, warnings, disconnects)
}

#[test]
fn handshake_success_brings_the_session_up() {
    let (addr, agent) = spawn_agent(|mut stream| {
        let (header, _) = read_frame(&mut stream);
        assert_eq!(header.msg_type, MsgType::Hello as u32);
        write_hello_reply(&mut stream, header.transaction_id, PROTOCOL_VERSION);
        // the client asks for agent status right after the handshake
        let (status_header, _) = read_frame(&mut stream);
        assert_eq!(status_header.msg_type, MsgType::Status as u32);
        let frame = codec::encode(
            MsgType::Status,
            status_header.transaction_id,
            &tether::protocol::StatusReply::default(),
        )
        .unwrap();
        stream.write_all(&frame).unwrap();
    });

    let session = Session::new();
    let connected = Rc::new(RefCell::new(None));
    let slot = connected.clone();
    session.connect(
        addr.to_string(),
        Box::new(move |r| *slot.borrow_mut() = Some(r)),
    );
    assert_eq!(session.state(), SessionState::Pending);

    poll_until(&session, Duration::from_secs(5), || {
        connected.borrow().is_some()
    });
    assert!(connected.borrow_mut().take().unwrap().is_ok());
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(session.arch(), Some(Arch::X64));

    agent.join().unwrap();
    session.disconnect(Box::new(|r| r.unwrap()));
    session.queue().drain();
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[test]
fn version_mismatch_refuses_the_connection() {
    let (addr, agent) = spawn_agent(|mut stream| {
        let (header, _) = read_frame(&mut stream);
        write_hello_reply(&mut stream, header.transaction_id, PROTOCOL_VERSION + 1);
    });

    let session = Session::new();
    let result = Rc::new(RefCell::new(None));
    let slot = result.clone();
    session.connect(
        addr.to_string(),
        Box::new(move |r| *slot.borrow_mut() = Some(r)),
    );
    poll_until(&session, Duration::from_secs(5), || result.borrow().is_some());

    match result.borrow_mut().take().unwrap() {
        Err(Error::VersionMismatch { agent, client }) => {
            assert_eq!(agent, PROTOCOL_VERSION + 1);
            assert_eq!(client, PROTOCOL_VERSION);
        }
        other => panic!("expected a version mismatch, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Disconnected);
    agent.join().unwrap();
}

#[test]
fn canceled_connect_reports_canceled_not_stale_state() {
    let (addr, agent) = spawn_agent(|_stream| {
        // accept and hold; the client cancels before handshaking
    });

    let session = Session::new();
    let connect_result = Rc::new(RefCell::new(None));
    let slot = connect_result.clone();
    session.connect(
        addr.to_string(),
        Box::new(move |r| *slot.borrow_mut() = Some(r)),
    );

    // cancel while the worker result is still in flight
    let disconnected = Rc::new(RefCell::new(None));
    let slot = disconnected.clone();
    session.disconnect(Box::new(move |r| *slot.borrow_mut() = Some(r)));
    session.queue().drain();
    assert!(disconnected.borrow_mut().take().unwrap().is_ok());
    assert_eq!(session.state(), SessionState::Disconnected);

    // the stale worker result must complete the original callback with
    // Canceled, not bring up a connection
    poll_until(&session, Duration::from_secs(5), || {
        connect_result.borrow().is_some()
    });
    assert!(matches!(
        connect_result.borrow_mut().take().unwrap(),
        Err(Error::Canceled)
    ));
    assert_eq!(session.state(), SessionState::Disconnected);
    agent.join().unwrap();
}

#[test]
fn oversized_frame_kills_the_connection() {
    let (addr, agent) = spawn_agent(|mut stream| {
        let (header, _) = read_frame(&mut stream);
        write_hello_reply(&mut stream, header.transaction_id, PROTOCOL_VERSION);
        let (_status, _) = read_frame(&mut stream);
        // a header whose declared body size is over the safety ceiling
        let mut corrupt = Vec::new();
        corrupt.extend((MsgType::NotifyIO as u32).to_le_bytes());
        corrupt.extend((MAX_MESSAGE_SIZE + 1).to_le_bytes());
        corrupt.extend(0u32.to_le_bytes());
        stream.write_all(&corrupt).unwrap();
    });

    let session = Session::new();
    let (errors, _warnings, disconnects) = recorder(&session);
    let connected = Rc::new(Cell::new(false));
    let flag = connected.clone();
    session.connect(addr.to_string(), Box::new(move |r| {
        r.unwrap();
        flag.set(true);
    }));
    poll_until(&session, Duration::from_secs(5), || connected.get());

    poll_until(&session, Duration::from_secs(5), || disconnects.get() > 0);
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(
        errors.borrow().iter().any(|e| e.contains("corrupted stream")),
        "fatal stream error surfaced: {:?}",
        errors.borrow()
    );
    agent.join().unwrap();
}

#[test]
fn reply_for_unknown_transaction_is_a_warning() {
    let (addr, agent) = spawn_agent(|mut stream| {
        let (header, _) = read_frame(&mut stream);
        write_hello_reply(&mut stream, header.transaction_id, PROTOCOL_VERSION);
        let (_status, _) = read_frame(&mut stream);
        // a reply that correlates to nothing
        let frame = codec::encode(
            MsgType::Pause,
            9999,
            &tether::protocol::PauseReply { status: 0 },
        )
        .unwrap();
        stream.write_all(&frame).unwrap();
    });

    let session = Session::new();
    let (errors, warnings, _disconnects) = recorder(&session);
    let connected = Rc::new(Cell::new(false));
    let flag = connected.clone();
    session.connect(addr.to_string(), Box::new(move |r| {
        r.unwrap();
        flag.set(true);
    }));
    poll_until(&session, Duration::from_secs(5), || connected.get());
    poll_until(&session, Duration::from_secs(5), || {
        !warnings.borrow().is_empty()
    });

    assert!(warnings.borrow()[0].contains("unknown transaction"));
    assert!(errors.borrow().is_empty(), "a dropped reply is not fatal");
    assert_eq!(session.state(), SessionState::Connected, "still connected");
    agent.join().unwrap();
}

#[test]
fn connect_preconditions_fail_posted() {
    let ts = tether::session::testing::connected_session();
    let result = Rc::new(RefCell::new(None));
    let slot = result.clone();
    ts.session.connect(
        "127.0.0.1:1".to_string(),
        Box::new(move |r| *slot.borrow_mut() = Some(r)),
    );
    assert!(result.borrow().is_none(), "failure is posted, not inline");
    ts.drain();
    assert!(matches!(
        result.borrow_mut().take().unwrap(),
        Err(Error::AlreadyConnected)
    ));
}

#[test]
fn snapshot_and_live_connection_are_exclusive() {
    // an open snapshot refuses a live connect with a dedicated error
    let dir = std::env::temp_dir().join(format!("tether-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("snap.json");
    let snapshot = serde_json::json!({
        "arch": "X64",
        "processes": [{"process_id": 1, "name": "crashed"}],
    });
    std::fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();

    let session = Session::new();
    session.open_snapshot(&path, Box::new(|r| r.unwrap()));
    session.queue().drain();
    assert_eq!(session.state(), SessionState::Snapshot);

    let result = Rc::new(RefCell::new(None));
    let slot = result.clone();
    session.connect(
        "127.0.0.1:1".to_string(),
        Box::new(move |r| *slot.borrow_mut() = Some(r)),
    );
    session.queue().drain();
    assert!(matches!(
        result.borrow_mut().take().unwrap(),
        Err(Error::SnapshotOpen)
    ));

    std::fs::remove_file(&path).ok();
}
