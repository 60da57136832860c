//! The debugging session: connection lifecycle, reply correlation and
//! notification demultiplexing.
//!
//! Everything here runs on one thread (see [`exec`]); the only real
//! threads are the connect worker and the stream reader in [`pending`],
//! both of which communicate exclusively through the wire-event channel.

pub mod breakpoint;
pub mod controller;
pub mod download;
pub mod error;
pub mod exec;
pub mod filter;
pub mod job;
pub mod observer;
pub mod pending;
pub mod process;
pub mod remote;
pub mod snapshot;
pub mod stack;
pub mod symbols;
pub mod system;
pub mod target;
pub mod testing;
pub mod thread;

use crate::protocol::codec::{ReadFrame, StreamBuffer};
use crate::protocol::{
    Arch, Koid, MsgType, NotifyException, NotifyIO, NotifyModules, NotifyProcessExiting,
    NotifyProcessKind, NotifyProcessStarting, NotifyThread, ProcessDescription, ResumeHow,
    ResumeRequest, StatusRequest,
};
use crate::session::breakpoint::Breakpoint;
use crate::session::error::Error;
use crate::session::exec::EventQueue;
use crate::session::observer::Observers;
use crate::session::pending::{PendingConnection, WireEvent};
use crate::session::remote::{Callback, NullRemoteApi, PendingReplies, RemoteApi, StreamRemoteApi};
use crate::session::snapshot::SnapshotRemoteApi;
use crate::session::system::System;
use crate::{muted_error, weak_error};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::net::Shutdown;
use std::path::Path;
use std::rc::{Rc, Weak};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use strum_macros::Display;

/// Shared handle every session object carries: the task queue, the
/// currently installed backend and the observer registries. Passed
/// explicitly at construction, never looked up through a global.
pub struct SessionLink {
    queue: EventQueue,
    remote: RefCell<Rc<dyn RemoteApi>>,
    observers: Observers,
}

impl SessionLink {
    fn new(queue: EventQueue) -> Rc<SessionLink> {
        let null = Rc::new(NullRemoteApi::new(queue.clone()));
        Rc::new(SessionLink {
            queue,
            remote: RefCell::new(null),
            observers: Observers::default(),
        })
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn observers(&self) -> &Observers {
        &self.observers
    }

    pub fn remote(&self) -> Rc<dyn RemoteApi> {
        self.remote.borrow().clone()
    }

    fn install_remote(&self, remote: Rc<dyn RemoteApi>) {
        *self.remote.borrow_mut() = remote;
    }

    fn reset_remote(&self) {
        *self.remote.borrow_mut() = Rc::new(NullRemoteApi::new(self.queue.clone()));
    }
}

/// Public view of the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    Disconnected,
    /// Connection attempt in flight on the worker thread.
    Pending,
    Connected,
    /// A post-mortem snapshot is open instead of a live agent.
    Snapshot,
}

struct ConnectionData {
    stream: std::net::TcpStream,
    reader: Option<JoinHandle<()>>,
}

/// Invariant: at most one of {live stream, snapshot, pending connection}
/// exists at any time.
enum ConnectionState {
    Disconnected,
    Pending(PendingConnection),
    Stream(ConnectionData),
    /// A backend without a live stream: snapshot, or a test double.
    Offline { is_snapshot: bool },
}

/// A canceled connect attempt whose worker result has not arrived yet.
/// The original callback is parked here so it can still be completed
/// (with `Canceled`) when the stale result shows up.
struct CanceledConnection {
    id: u32,
    cb: Option<Callback<()>>,
    worker: Option<JoinHandle<()>>,
}

pub struct Session {
    me: Weak<Session>,
    link: Rc<SessionLink>,
    system: Rc<System>,
    pending_replies: Rc<PendingReplies>,
    conn: RefCell<ConnectionState>,
    canceled: RefCell<Vec<CanceledConnection>>,
    next_connection_id: Cell<u32>,
    stream_buf: RefCell<StreamBuffer>,
    /// Component monikers we expect to start (populated before a
    /// component launch so the starting notification can be routed).
    expected_components: RefCell<HashSet<String>>,
    arch: Cell<Option<Arch>>,
    wire_tx: Sender<WireEvent>,
    wire_rx: Receiver<WireEvent>,
}

impl Session {
    pub fn new() -> Rc<Session> {
        let queue = EventQueue::new();
        let link = SessionLink::new(queue);
        let system = System::new(link.clone());
        let (wire_tx, wire_rx) = mpsc::channel();
        Rc::new_cyclic(|me| Session {
            me: me.clone(),
            link,
            system,
            pending_replies: Rc::new(PendingReplies::new()),
            conn: RefCell::new(ConnectionState::Disconnected),
            canceled: RefCell::default(),
            next_connection_id: Cell::new(1),
            stream_buf: RefCell::new(StreamBuffer::new()),
            expected_components: RefCell::default(),
            arch: Cell::new(None),
            wire_tx,
            wire_rx,
        })
    }

    pub fn system(&self) -> &Rc<System> {
        &self.system
    }

    pub fn observers(&self) -> &Observers {
        self.link.observers()
    }

    pub fn queue(&self) -> &EventQueue {
        self.link.queue()
    }

    pub fn remote(&self) -> Rc<dyn RemoteApi> {
        self.link.remote()
    }

    pub fn arch(&self) -> Option<Arch> {
        self.arch.get()
    }

    pub fn state(&self) -> SessionState {
        match &*self.conn.borrow() {
            ConnectionState::Disconnected => SessionState::Disconnected,
            ConnectionState::Pending(_) => SessionState::Pending,
            ConnectionState::Stream(_) => SessionState::Connected,
            ConnectionState::Offline { is_snapshot: true } => SessionState::Snapshot,
            ConnectionState::Offline { is_snapshot: false } => SessionState::Connected,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Connected | SessionState::Snapshot
        )
    }

    // ------------------------------ connection lifecycle --------------------------------------

    /// Start a connection attempt to `addr` ("host:port"). The blocking
    /// resolve/connect happens on a worker thread; the callback fires on
    /// this thread once the handshake concludes. Preconditions fail
    /// through the posted path.
    pub fn connect(&self, addr: impl Into<String>, cb: Callback<()>) {
        if let Some(err) = self.connect_precondition_error() {
            self.link.queue().post(move || cb(Err(err)));
            return;
        }
        let id = self.next_connection_id.get();
        self.next_connection_id.set(id + 1);
        let worker = pending::spawn_connect(id, addr.into(), self.wire_tx.clone());
        *self.conn.borrow_mut() = ConnectionState::Pending(PendingConnection {
            id,
            cb: Some(cb),
            worker: Some(worker),
        });
    }

    fn connect_precondition_error(&self) -> Option<Error> {
        match &*self.conn.borrow() {
            ConnectionState::Disconnected => None,
            ConnectionState::Pending(_) => Some(Error::ConnectionPending),
            ConnectionState::Stream(_) | ConnectionState::Offline { is_snapshot: false } => {
                Some(Error::AlreadyConnected)
            }
            ConnectionState::Offline { is_snapshot: true } => Some(Error::SnapshotOpen),
        }
    }

    /// Open a post-mortem snapshot. Same exclusivity rules as a live
    /// connection.
    pub fn open_snapshot(&self, path: &Path, cb: Callback<()>) {
        if let Some(err) = self.connect_precondition_error() {
            self.link.queue().post(move || cb(Err(err)));
            return;
        }
        match SnapshotRemoteApi::load(self.link.queue().clone(), path) {
            Ok(api) => {
                self.arch.set(Some(api.arch()));
                self.install_backend(Rc::new(api), true);
                let queue = self.link.queue().clone();
                queue.post(move || cb(Ok(())));
            }
            Err(e) => {
                self.link.queue().post(move || cb(Err(e)));
            }
        }
    }

    /// Install a backend without a live stream. Drives the snapshot path
    /// and serves as the seam test fixtures use to mount a mock agent.
    pub fn connect_with_remote(&self, remote: Rc<dyn RemoteApi>) {
        self.install_backend(remote, false);
    }

    fn install_backend(&self, remote: Rc<dyn RemoteApi>, is_snapshot: bool) {
        self.link.install_remote(remote);
        *self.conn.borrow_mut() = ConnectionState::Offline { is_snapshot };
        self.system.did_connect();
        self.link.observers().notify_session(|o| o.on_connected());
    }

    /// Tear down whatever connection-like state exists. A pending attempt
    /// is canceled: its callback is parked and completes with `Canceled`
    /// when the stale worker result arrives.
    pub fn disconnect(&self, cb: Callback<()>) {
        let state = std::mem::replace(&mut *self.conn.borrow_mut(), ConnectionState::Disconnected);
        let queue = self.link.queue().clone();
        match state {
            ConnectionState::Disconnected => {
                queue.post(move || cb(Err(Error::NotConnected)));
                return;
            }
            ConnectionState::Pending(pending) => {
                log::debug!(target: "session", "canceling pending connection {}", pending.id);
                self.canceled.borrow_mut().push(CanceledConnection {
                    id: pending.id,
                    cb: pending.cb,
                    worker: pending.worker,
                });
            }
            ConnectionState::Stream(data) => {
                self.teardown_stream(data);
            }
            ConnectionState::Offline { .. } => {
                self.link.reset_remote();
                self.system.did_disconnect();
                self.link.observers().notify_session(|o| o.on_disconnected());
            }
        }
        queue.post(move || cb(Ok(())));
    }

    /// Ask the agent to quit, then drop the connection.
    pub fn quit_agent(&self, cb: Callback<()>) {
        let me = self.me.clone();
        self.link.remote().quit_agent(
            crate::protocol::QuitAgentRequest {},
            Box::new(move |result| {
                if let Some(session) = me.upgrade() {
                    session.clear_connection_data();
                }
                match result {
                    // the agent may drop the stream before replying
                    Ok(_) | Err(Error::ConnectionLost) => cb(Ok(())),
                    Err(e) => cb(Err(e)),
                }
            }),
        );
    }

    /// Fatal-path teardown: close the stream, fail in-flight requests,
    /// locally detach everything.
    fn clear_connection_data(&self) {
        let state = std::mem::replace(&mut *self.conn.borrow_mut(), ConnectionState::Disconnected);
        match state {
            ConnectionState::Stream(data) => self.teardown_stream(data),
            ConnectionState::Offline { .. } => {
                self.link.reset_remote();
                self.system.did_disconnect();
                self.link.observers().notify_session(|o| o.on_disconnected());
            }
            other => {
                // nothing stream-like to clear, restore what we took
                *self.conn.borrow_mut() = other;
            }
        }
    }

    fn teardown_stream(&self, mut data: ConnectionData) {
        muted_error!(data.stream.shutdown(Shutdown::Both), "stream shutdown:");
        if let Some(reader) = data.reader.take() {
            // the shutdown above unblocks the reader, join is bounded
            let _ = reader.join();
        }
        self.stream_buf.borrow_mut().clear();
        self.pending_replies.fail_all(|| Error::ConnectionLost);
        self.link.reset_remote();
        self.system.did_disconnect();
        self.link.observers().notify_session(|o| o.on_disconnected());
    }

    // ------------------------------ wire event pump -------------------------------------------

    /// Wait up to `timeout` for one wire event, process it and drain the
    /// task queue. Returns false on timeout.
    pub fn poll_wire(&self, timeout: Duration) -> bool {
        let event = self.wire_rx.recv_timeout(timeout);
        let handled = match event {
            Ok(event) => {
                self.handle_wire_event(event);
                true
            }
            Err(_) => false,
        };
        self.link.queue().drain();
        handled
    }

    /// Process one event from the worker threads. Public so harnesses
    /// and tests can inject events deterministically.
    pub fn handle_wire_event(&self, event: WireEvent) {
        match event {
            WireEvent::ConnectResult { id, result } => self.on_connect_result(id, result),
            WireEvent::Bytes(bytes) => {
                if matches!(&*self.conn.borrow(), ConnectionState::Stream(_)) {
                    self.stream_buf.borrow_mut().append(&bytes);
                    self.on_stream_readable();
                }
            }
            WireEvent::Closed(err) => {
                if matches!(&*self.conn.borrow(), ConnectionState::Stream(_)) {
                    if let Some(e) = err {
                        log::warn!(target: "session", "stream closed with error: {e}");
                    }
                    let error = Error::ConnectionLost;
                    self.link
                        .observers()
                        .notify_session(|o| o.on_session_error(&error));
                    self.clear_connection_data();
                }
            }
        }
    }

    fn on_connect_result(&self, id: u32, result: std::io::Result<std::net::TcpStream>) {
        // stale result for a canceled attempt: report Canceled, never the
        // stale stream
        let is_current = matches!(&*self.conn.borrow(), ConnectionState::Pending(p) if p.id == id);
        if !is_current {
            let entry = {
                let mut canceled = self.canceled.borrow_mut();
                let index = canceled.iter().position(|c| c.id == id);
                index.map(|i| canceled.remove(i))
            };
            if let Some(mut entry) = entry {
                if let Some(worker) = entry.worker.take() {
                    let _ = worker.join();
                }
                if let Some(cb) = entry.cb.take() {
                    cb(Err(Error::Canceled));
                }
            }
            drop(result); // a successfully opened stale stream just closes
            return;
        }

        let ConnectionState::Pending(mut pending) =
            std::mem::replace(&mut *self.conn.borrow_mut(), ConnectionState::Disconnected)
        else {
            unreachable!("checked above");
        };
        if let Some(worker) = pending.worker.take() {
            let _ = worker.join();
        }
        let cb = pending.cb.take().expect("callback taken once");

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!(target: "session", "connect failed: {e}");
                cb(Err(Error::Io(e)));
                return;
            }
        };

        match self.complete_connection(stream) {
            Ok(()) => cb(Ok(())),
            Err(e) => {
                *self.conn.borrow_mut() = ConnectionState::Disconnected;
                cb(Err(e));
            }
        }
    }

    /// Synchronous handshake plus plumbing installation. Runs on the
    /// session thread with the request/reply machinery not yet live.
    fn complete_connection(&self, stream: std::net::TcpStream) -> Result<(), Error> {
        let hello = pending::handshake(&stream, self.pending_replies.alloc())?;
        log::info!(
            target: "session",
            "connected to agent: protocol {} on {}",
            hello.version,
            hello.arch
        );
        self.arch.set(Some(hello.arch));
        muted_error!(stream.set_nodelay(true), "nodelay:");

        let writer = stream.try_clone().map_err(Error::Io)?;
        let reader_stream = stream.try_clone().map_err(Error::Io)?;
        self.link.install_remote(Rc::new(StreamRemoteApi::new(
            self.link.queue().clone(),
            self.pending_replies.clone(),
            Box::new(writer),
        )));
        let reader = pending::spawn_reader(reader_stream, self.wire_tx.clone());
        *self.conn.borrow_mut() = ConnectionState::Stream(ConnectionData {
            stream,
            reader: Some(reader),
        });

        self.system.did_connect();
        self.link.observers().notify_session(|o| o.on_connected());
        self.request_agent_status();
        Ok(())
    }

    /// Ask the agent what it is already attached to and what sits in
    /// limbo, fanning the results to session observers.
    fn request_agent_status(&self) {
        let me = self.me.clone();
        self.link.remote().status(
            StatusRequest {},
            Box::new(move |result| {
                let Some(session) = me.upgrade() else { return };
                let Some(reply) = weak_error!(result, "agent status:") else {
                    return;
                };
                if !reply.processes.is_empty() {
                    session
                        .link
                        .observers()
                        .notify_session(|o| o.on_previously_attached(&reply.processes));
                }
                for limbo in &reply.limbo {
                    session
                        .link
                        .observers()
                        .notify_session(|o| o.on_process_in_limbo(limbo));
                }
            }),
        );
    }

    // ------------------------------ frame dispatch --------------------------------------------

    fn on_stream_readable(&self) {
        loop {
            let frame = self.stream_buf.borrow_mut().next_frame();
            match frame {
                ReadFrame::Pending => return,
                ReadFrame::Corrupt(header) => {
                    let err = Error::StreamCorrupt(header.size);
                    log::error!(target: "session", "{err}");
                    self.link
                        .observers()
                        .notify_session(|o| o.on_session_error(&err));
                    self.clear_connection_data();
                    return;
                }
                ReadFrame::Complete(frame) => {
                    if frame.header.transaction_id == 0 {
                        self.dispatch_notification(frame.header.msg_type, &frame.body);
                    } else if !self
                        .pending_replies
                        .complete(frame.header.transaction_id, Ok(frame.body))
                    {
                        let msg = format!(
                            "reply for unknown transaction {} dropped",
                            frame.header.transaction_id
                        );
                        log::warn!(target: "session", "{msg}");
                        self.link
                            .observers()
                            .notify_session(|o| o.on_session_warning(&msg));
                    }
                }
            }
        }
    }

    fn dispatch_notification(&self, msg_type: u32, body: &[u8]) {
        let Some(msg_type) = MsgType::from_repr(msg_type) else {
            log::warn!(target: "session", "unknown notification type {msg_type}, ignored");
            return;
        };
        match msg_type {
            MsgType::NotifyException => {
                if let Some(notify) = weak_error!(crate::protocol::codec::decode_body::<NotifyException>(body)) {
                    self.dispatch_exception(notify);
                }
            }
            MsgType::NotifyProcessStarting => {
                if let Some(notify) =
                    weak_error!(crate::protocol::codec::decode_body::<NotifyProcessStarting>(body))
                {
                    self.dispatch_process_starting(notify);
                }
            }
            MsgType::NotifyProcessExiting => {
                if let Some(notify) =
                    weak_error!(crate::protocol::codec::decode_body::<NotifyProcessExiting>(body))
                {
                    self.dispatch_process_exiting(notify);
                }
            }
            MsgType::NotifyThreadStarting => {
                if let Some(notify) = weak_error!(crate::protocol::codec::decode_body::<NotifyThread>(body)) {
                    self.dispatch_thread_starting(notify);
                }
            }
            MsgType::NotifyThreadExiting => {
                if let Some(notify) = weak_error!(crate::protocol::codec::decode_body::<NotifyThread>(body)) {
                    self.dispatch_thread_exiting(notify);
                }
            }
            MsgType::NotifyModules => {
                if let Some(notify) = weak_error!(crate::protocol::codec::decode_body::<NotifyModules>(body)) {
                    self.dispatch_modules(notify);
                }
            }
            MsgType::NotifyIO => {
                if let Some(notify) = weak_error!(crate::protocol::codec::decode_body::<NotifyIO>(body)) {
                    self.dispatch_io(notify);
                }
            }
            other => {
                log::warn!(target: "session", "message type {other} is not a notification, ignored");
            }
        }
    }

    // ------------------------------ notification handlers -------------------------------------

    /// Central stop handler. Breakpoint statistics are applied before any
    /// observer can run; off-cycle conditional hits are swallowed without
    /// touching the controller layer; one-shots the agent already removed
    /// are torn down afterwards.
    pub fn dispatch_exception(&self, notify: NotifyException) {
        let Some(process) = self.system.process_by_koid(notify.process_id) else {
            log::warn!(target: "session", "exception for unknown process {}", notify.process_id);
            return;
        };
        let Some(thread) = process.thread_by_koid(notify.thread.thread_id) else {
            log::warn!(
                target: "session",
                "exception for unknown thread {} in process {}",
                notify.thread.thread_id,
                notify.process_id
            );
            return;
        };

        // 1: all breakpoint state is brought up to date first
        let mut hits: Vec<Weak<Breakpoint>> = Vec::with_capacity(notify.hit_breakpoints.len());
        let mut live_hits: Vec<Rc<Breakpoint>> = Vec::new();
        for stats in &notify.hit_breakpoints {
            match self.system.breakpoint_by_id(stats.id) {
                Some(bp) => {
                    bp.update_stats(stats);
                    hits.push(Rc::downgrade(&bp));
                    live_hits.push(bp);
                }
                // deleted client-side while the notification was in
                // transit; keep a dead entry, the thread filters it
                None => hits.push(Weak::new()),
            }
        }

        // 2: off-cycle conditional hits never reach the controllers
        let suppress = notify.r#type.is_breakpoint()
            && !live_hits.is_empty()
            && live_hits.iter().all(|b| b.off_cycle());
        if suppress {
            log::debug!(
                target: "session",
                "conditional breakpoint hit suppressed on thread {}",
                notify.thread.thread_id
            );
            thread.resume_quiet();
        } else {
            thread.set_metadata(&notify.thread);
            thread.set_frames(&notify.frames, false);
            thread.on_exception(notify.r#type, &hits);
        }

        // 3: one-shots the agent already removed are deleted locally,
        // without a redundant remove message
        for stats in &notify.hit_breakpoints {
            if !stats.should_delete {
                continue;
            }
            if let Some(bp) = self.system.breakpoint_by_id(stats.id) {
                bp.backend_breakpoint_removed();
                self.system.delete_breakpoint(&bp);
            }
        }
    }

    pub fn dispatch_process_starting(&self, notify: NotifyProcessStarting) {
        if notify.kind == NotifyProcessKind::Limbo {
            let desc = ProcessDescription {
                process_id: notify.process_id,
                name: notify.name,
                components: notify.component.into_iter().collect(),
            };
            self.link
                .observers()
                .notify_session(|o| o.on_process_in_limbo(&desc));
            return;
        }

        if let Some(component) = &notify.component {
            if self.expected_components.borrow_mut().remove(component) {
                log::debug!(target: "session", "expected component {component} started");
            }
        }

        if self.system.is_process_attached(notify.process_id) {
            log::warn!(
                target: "session",
                "process {} announced twice, ignored",
                notify.process_id
            );
            return;
        }
        let target = self.system.free_target();
        target.assign_from_agent(notify.process_id, notify.name);
    }

    pub fn dispatch_process_exiting(&self, notify: NotifyProcessExiting) {
        let target = self
            .system
            .targets()
            .into_iter()
            .find(|t| t.process_koid() == Some(notify.process_id));
        match target {
            Some(target) => target.on_process_exiting(notify.return_code),
            None => log::warn!(
                target: "session",
                "exit notification for unknown process {}",
                notify.process_id
            ),
        }
    }

    pub fn dispatch_thread_starting(&self, notify: NotifyThread) {
        if let Some(process) = self.system.process_by_koid(notify.record.process_id) {
            process.on_thread_starting(&notify.record);
        }
    }

    pub fn dispatch_thread_exiting(&self, notify: NotifyThread) {
        if let Some(process) = self.system.process_by_koid(notify.record.process_id) {
            process.on_thread_exiting(notify.record.thread_id);
        }
    }

    /// Module list update. Threads the agent stopped for the load are
    /// resumed, except that a single stopped thread is kept paused when
    /// pause-on-launch is set. (Multi-thread loads bypass the setting;
    /// behavior kept from the original system.)
    pub fn dispatch_modules(&self, notify: NotifyModules) {
        let Some(process) = self.system.process_by_koid(notify.process_id) else {
            return;
        };
        process.update_modules(notify.modules);

        let stopped = notify.stopped_threads;
        if stopped.is_empty() {
            return;
        }
        if stopped.len() == 1 && self.system.settings().pause_on_launch.get() {
            return;
        }
        self.link.remote().resume(
            ResumeRequest {
                process_id: notify.process_id,
                thread_ids: stopped,
                how: ResumeHow::ResolveAndContinue,
                range_begin: 0,
                range_end: 0,
            },
            Box::new(|result| {
                weak_error!(result, "resume after module load:");
            }),
        );
    }

    pub fn dispatch_io(&self, notify: NotifyIO) {
        if let Some(process) = self.system.process_by_koid(notify.process_id) {
            process.append_io(notify.kind, &notify.data);
        }
    }

    // ------------------------------ component launches ----------------------------------------

    /// Announce an upcoming component launch so its process-starting
    /// notification is recognized.
    pub fn expect_component(&self, moniker: impl Into<String>) {
        self.expected_components.borrow_mut().insert(moniker.into());
    }

    /// Koid helper used by front ends: the process currently running in
    /// any target, by koid.
    pub fn process_by_koid(&self, koid: Koid) -> Option<Rc<process::Process>> {
        self.system.process_by_koid(koid)
    }
}

impl Drop for Session {
    /// Callbacks are never dropped silently: anything still parked
    /// reports cancellation.
    fn drop(&mut self) {
        if let ConnectionState::Pending(pending) =
            std::mem::replace(&mut *self.conn.borrow_mut(), ConnectionState::Disconnected)
        {
            if let Some(cb) = pending.cb {
                cb(Err(Error::Canceled));
            }
        }
        for mut canceled in self.canceled.borrow_mut().drain(..) {
            if let Some(cb) = canceled.cb.take() {
                cb(Err(Error::Canceled));
            }
        }
    }
}
