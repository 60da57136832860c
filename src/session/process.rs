//! Live process object: thread registry, module list, buffered stdio and
//! the single-flight TLS helper loader.

use crate::protocol::{
    IoKind, Koid, Module, ReadMemoryRequest, ThreadRecord, ThreadsRequest, WriteMemoryRequest,
};
use crate::session::error::Error;
use crate::session::remote::Callback;
use crate::session::symbols::{ProcessSymbols, SymbolCatalog};
use crate::session::target::Target;
use crate::session::thread::Thread;
use crate::session::SessionLink;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

/// Upper bound on buffered stdout/stderr bytes per stream; the oldest
/// bytes are dropped first once the cap is reached.
pub const MAX_IO_BUFFER_SIZE: usize = 1024 * 1024;

/// Bytes read per TLS helper blob.
const TLS_HELPER_SIZE: u32 = 32;

/// Marker symbols exported by the C runtime describing the thread-local
/// storage layout. All three must resolve for helpers to load.
const TLS_HELPER_SYMBOLS: [&str; 3] = [
    "__libc_tls_thrd_layout",
    "__libc_tls_link_map_offset",
    "__libc_tls_dtv_offset",
];

/// Thread-local-storage layout descriptors read out of the process.
#[derive(Debug, Clone, Default)]
pub struct TlsHelpers {
    pub thrd_layout: Vec<u8>,
    pub link_map_offset: Vec<u8>,
    pub dtv_offset: Vec<u8>,
}

enum TlsState {
    Unloaded,
    /// Reads in flight; callers queue up and all resolve together.
    Loading(Vec<Callback<Rc<TlsHelpers>>>),
    Loaded(Rc<TlsHelpers>),
    Failed(String),
}

struct TlsCollector {
    parts: [Option<Vec<u8>>; 3],
    failed: bool,
}

/// Capped stdio ring.
#[derive(Default)]
struct IoBuffer {
    data: VecDeque<u8>,
}

impl IoBuffer {
    fn append(&mut self, bytes: &[u8]) {
        self.data.extend(bytes);
        while self.data.len() > MAX_IO_BUFFER_SIZE {
            self.data.pop_front();
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        self.data.iter().copied().collect()
    }
}

pub struct Process {
    me: Weak<Process>,
    link: Rc<SessionLink>,
    target: Weak<Target>,
    koid: Koid,
    name: String,
    threads: RefCell<HashMap<Koid, Rc<Thread>>>,
    symbols: Rc<ProcessSymbols>,
    tls: RefCell<TlsState>,
    stdout: RefCell<IoBuffer>,
    stderr: RefCell<IoBuffer>,
}

impl Process {
    pub(crate) fn new(
        link: Rc<SessionLink>,
        target: &Rc<Target>,
        catalog: Rc<SymbolCatalog>,
        koid: Koid,
        name: impl Into<String>,
    ) -> Rc<Process> {
        Rc::new_cyclic(|me| Process {
            me: me.clone(),
            link,
            target: Rc::downgrade(target),
            koid,
            name: name.into(),
            threads: RefCell::default(),
            symbols: Rc::new(ProcessSymbols::new(catalog)),
            tls: RefCell::new(TlsState::Unloaded),
            stdout: RefCell::default(),
            stderr: RefCell::default(),
        })
    }

    pub fn koid(&self) -> Koid {
        self.koid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> Option<Rc<Target>> {
        self.target.upgrade()
    }

    pub fn symbols(&self) -> Rc<ProcessSymbols> {
        self.symbols.clone()
    }

    // ------------------------------ threads ---------------------------------------------------

    pub fn threads(&self) -> Vec<Rc<Thread>> {
        self.threads.borrow().values().cloned().collect()
    }

    pub fn thread_by_koid(&self, koid: Koid) -> Option<Rc<Thread>> {
        self.threads.borrow().get(&koid).cloned()
    }

    pub(crate) fn on_thread_starting(&self, record: &ThreadRecord) -> Rc<Thread> {
        let me = self.me.upgrade().expect("process alive during dispatch");
        let thread = Thread::new(self.link.clone(), &me, record);
        self.threads.borrow_mut().insert(record.thread_id, thread.clone());
        log::debug!(target: "process", "process {}: thread {} started", self.koid, record.thread_id);
        self.link
            .observers()
            .notify_process(|o| o.on_thread_created(&thread));
        thread
    }

    pub(crate) fn on_thread_exiting(&self, koid: Koid) {
        let removed = self.threads.borrow_mut().remove(&koid);
        if let Some(thread) = removed {
            log::debug!(target: "process", "process {}: thread {koid} exited", self.koid);
            self.link
                .observers()
                .notify_process(|o| o.on_thread_will_be_destroyed(&thread));
        }
    }

    /// Reconcile the thread registry with a fresh agent listing.
    pub fn sync_threads(&self, cb: Callback<()>) {
        let me = self.me.clone();
        self.link.remote().threads(
            ThreadsRequest {
                process_id: self.koid,
            },
            Box::new(move |result| {
                let Some(process) = me.upgrade() else {
                    cb(Err(Error::ObjectGone("process")));
                    return;
                };
                match result {
                    Ok(reply) => {
                        let live: Vec<Koid> = reply.threads.iter().map(|t| t.thread_id).collect();
                        let gone: Vec<Koid> = process
                            .threads
                            .borrow()
                            .keys()
                            .copied()
                            .filter(|koid| !live.contains(koid))
                            .collect();
                        for koid in gone {
                            process.on_thread_exiting(koid);
                        }
                        for record in &reply.threads {
                            match process.thread_by_koid(record.thread_id) {
                                Some(thread) => thread.set_metadata(record),
                                None => {
                                    process.on_thread_starting(record);
                                }
                            }
                        }
                        cb(Ok(()))
                    }
                    Err(e) => cb(Err(e)),
                }
            }),
        );
    }

    // ------------------------------ modules ---------------------------------------------------

    pub fn modules(&self) -> Vec<Module> {
        self.symbols.modules()
    }

    /// Install a new module list and fan the symbol-change notifications
    /// out (process observers first, then breakpoint re-resolution).
    pub(crate) fn update_modules(&self, modules: Vec<Module>) {
        let me = self.me.upgrade().expect("process alive during dispatch");
        self.symbols.update_modules(modules);
        self.link
            .observers()
            .notify_process(|o| o.on_modules_loaded(&me));
        if let Some(system) = self.target.upgrade().and_then(|t| t.system()) {
            system.on_process_modules_changed(&me);
        }
    }

    // ------------------------------ memory ----------------------------------------------------

    pub fn read_memory(&self, address: u64, size: u32, cb: Callback<Vec<u8>>) {
        self.link.remote().read_memory(
            ReadMemoryRequest {
                process_id: self.koid,
                address,
                size,
            },
            Box::new(move |result| match result {
                Ok(reply) => {
                    let mut data = Vec::new();
                    for block in reply.blocks {
                        if !block.valid {
                            cb(Err(Error::Backend(format!(
                                "memory at {:#x} is unmapped",
                                block.address
                            ))));
                            return;
                        }
                        data.extend(block.data);
                    }
                    cb(Ok(data))
                }
                Err(e) => cb(Err(e)),
            }),
        );
    }

    pub fn write_memory(&self, address: u64, data: Vec<u8>, cb: Callback<()>) {
        self.link.remote().write_memory(
            WriteMemoryRequest {
                process_id: self.koid,
                address,
                data,
            },
            Box::new(move |result| match result {
                Ok(reply) if reply.status == crate::protocol::status::OK => cb(Ok(())),
                Ok(reply) => cb(Err(Error::BackendStatus {
                    request: crate::protocol::MsgType::WriteMemory,
                    status: reply.status,
                })),
                Err(e) => cb(Err(e)),
            }),
        );
    }

    // ------------------------------ TLS helpers -----------------------------------------------

    /// Fetch the TLS layout helper blobs. The three underlying memory
    /// reads are single-flight: concurrent callers queue on the first
    /// load and every callback receives the same shared result.
    pub fn get_tls_helpers(&self, cb: Callback<Rc<TlsHelpers>>) {
        let queue = self.link.queue().clone();
        match &mut *self.tls.borrow_mut() {
            TlsState::Loaded(helpers) => {
                let helpers = helpers.clone();
                queue.post(move || cb(Ok(helpers)));
                return;
            }
            TlsState::Failed(msg) => {
                let msg = msg.clone();
                queue.post(move || cb(Err(Error::Backend(msg))));
                return;
            }
            TlsState::Loading(waiters) => {
                waiters.push(cb);
                return;
            }
            TlsState::Unloaded => {}
        }
        *self.tls.borrow_mut() = TlsState::Loading(vec![cb]);
        self.start_tls_load();
    }

    fn start_tls_load(&self) {
        let mut addresses = Vec::with_capacity(TLS_HELPER_SYMBOLS.len());
        for symbol in TLS_HELPER_SYMBOLS {
            match self.symbols.symbol_address(symbol) {
                Some(addr) => addresses.push(addr),
                None => {
                    self.finish_tls(Err(format!("helper symbol `{symbol}` not found")));
                    return;
                }
            }
        }

        let collector = Rc::new(RefCell::new(TlsCollector {
            parts: [None, None, None],
            failed: false,
        }));
        for (index, address) in addresses.into_iter().enumerate() {
            let me = self.me.clone();
            let collector = collector.clone();
            self.read_memory(
                address,
                TLS_HELPER_SIZE,
                Box::new(move |result| {
                    let Some(process) = me.upgrade() else { return };
                    let mut state = collector.borrow_mut();
                    if state.failed {
                        return;
                    }
                    match result {
                        Ok(data) => {
                            state.parts[index] = Some(data);
                            if state.parts.iter().all(Option::is_some) {
                                let helpers = TlsHelpers {
                                    thrd_layout: state.parts[0].take().expect("checked"),
                                    link_map_offset: state.parts[1].take().expect("checked"),
                                    dtv_offset: state.parts[2].take().expect("checked"),
                                };
                                drop(state);
                                process.finish_tls(Ok(helpers));
                            }
                        }
                        Err(e) => {
                            state.failed = true;
                            drop(state);
                            process.finish_tls(Err(format!("helper read failed: {e}")));
                        }
                    }
                }),
            );
        }
    }

    fn finish_tls(&self, result: Result<TlsHelpers, String>) {
        let waiters = match take_tls_waiters(&self.tls, &result) {
            Some(w) => w,
            None => return,
        };
        let queue = self.link.queue().clone();
        match result {
            Ok(helpers) => {
                let helpers = Rc::new(helpers);
                for cb in waiters {
                    let helpers = helpers.clone();
                    queue.post(move || cb(Ok(helpers)));
                }
            }
            Err(msg) => {
                for cb in waiters {
                    let msg = msg.clone();
                    queue.post(move || cb(Err(Error::Backend(msg))));
                }
            }
        }
    }

    // ------------------------------ stdio -----------------------------------------------------

    pub(crate) fn append_io(&self, kind: IoKind, data: &[u8]) {
        match kind {
            IoKind::Stdout => self.stdout.borrow_mut().append(data),
            IoKind::Stderr => self.stderr.borrow_mut().append(data),
        }
        if let Some(me) = self.me.upgrade() {
            self.link
                .observers()
                .notify_process(|o| o.on_io(&me, kind, data));
        }
    }

    pub fn stdout(&self) -> Vec<u8> {
        self.stdout.borrow().snapshot()
    }

    pub fn stderr(&self) -> Vec<u8> {
        self.stderr.borrow().snapshot()
    }
}

/// Swap the TLS state to its terminal value, returning queued waiters.
/// `None` when the load already concluded (late duplicate completion).
fn take_tls_waiters(
    tls: &RefCell<TlsState>,
    result: &Result<TlsHelpers, String>,
) -> Option<Vec<Callback<Rc<TlsHelpers>>>> {
    let mut slot = tls.borrow_mut();
    if !matches!(*slot, TlsState::Loading(_)) {
        return None;
    }
    let next = match result {
        Ok(helpers) => TlsState::Loaded(Rc::new(helpers.clone())),
        Err(msg) => TlsState::Failed(msg.clone()),
    };
    match std::mem::replace(&mut *slot, next) {
        TlsState::Loading(waiters) => Some(waiters),
        _ => unreachable!("checked above"),
    }
}
