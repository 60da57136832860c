//! The request/reply surface of the remote debug agent.
//!
//! Every debugging operation is one [`RemoteApi`] method: it takes a
//! request struct and a reply callback, returns immediately, and the
//! callback fires on a later queue drain when the reply (or a transport
//! error) arrives. Three implementations exist: [`StreamRemoteApi`]
//! serializes over the live byte stream, the snapshot backend answers
//! from a post-mortem file, and tests use the mock in
//! [`crate::session::testing`].

use crate::protocol::codec;
use crate::protocol::MsgType;
use crate::session::error::Error;
use crate::session::exec::EventQueue;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io::Write;

pub type Callback<T> = Box<dyn FnOnce(Result<T, Error>)>;

/// Lists every agent operation once; consumers define a local callback
/// macro to stamp out trait methods, forwarding impls or mock variants.
#[macro_export]
macro_rules! remote_api_methods {
    ($m:ident) => {
        $m! {
            hello => Hello($crate::protocol::HelloRequest, $crate::protocol::HelloReply),
            launch => Launch($crate::protocol::LaunchRequest, $crate::protocol::LaunchReply),
            kill => Kill($crate::protocol::KillRequest, $crate::protocol::KillReply),
            attach => Attach($crate::protocol::AttachRequest, $crate::protocol::AttachReply),
            detach => Detach($crate::protocol::DetachRequest, $crate::protocol::DetachReply),
            modules => Modules($crate::protocol::ModulesRequest, $crate::protocol::ModulesReply),
            pause => Pause($crate::protocol::PauseRequest, $crate::protocol::PauseReply),
            resume => Resume($crate::protocol::ResumeRequest, $crate::protocol::ResumeReply),
            process_tree => ProcessTree($crate::protocol::ProcessTreeRequest, $crate::protocol::ProcessTreeReply),
            threads => Threads($crate::protocol::ThreadsRequest, $crate::protocol::ThreadsReply),
            read_memory => ReadMemory($crate::protocol::ReadMemoryRequest, $crate::protocol::ReadMemoryReply),
            write_memory => WriteMemory($crate::protocol::WriteMemoryRequest, $crate::protocol::WriteMemoryReply),
            read_registers => ReadRegisters($crate::protocol::ReadRegistersRequest, $crate::protocol::ReadRegistersReply),
            write_registers => WriteRegisters($crate::protocol::WriteRegistersRequest, $crate::protocol::WriteRegistersReply),
            add_or_change_breakpoint => AddOrChangeBreakpoint($crate::protocol::AddOrChangeBreakpointRequest, $crate::protocol::AddOrChangeBreakpointReply),
            remove_breakpoint => RemoveBreakpoint($crate::protocol::RemoveBreakpointRequest, $crate::protocol::RemoveBreakpointReply),
            sys_info => SysInfo($crate::protocol::SysInfoRequest, $crate::protocol::SysInfoReply),
            status => Status($crate::protocol::StatusRequest, $crate::protocol::StatusReply),
            process_status => ProcessStatus($crate::protocol::ProcessStatusRequest, $crate::protocol::ProcessStatusReply),
            thread_status => ThreadStatus($crate::protocol::ThreadStatusRequest, $crate::protocol::ThreadStatusReply),
            address_space => AddressSpace($crate::protocol::AddressSpaceRequest, $crate::protocol::AddressSpaceReply),
            update_filter => UpdateFilter($crate::protocol::UpdateFilterRequest, $crate::protocol::UpdateFilterReply),
            load_info_handle_table => LoadInfoHandleTable($crate::protocol::LoadInfoHandleTableRequest, $crate::protocol::LoadInfoHandleTableReply),
            config_agent => ConfigAgent($crate::protocol::ConfigAgentRequest, $crate::protocol::ConfigAgentReply),
            quit_agent => QuitAgent($crate::protocol::QuitAgentRequest, $crate::protocol::QuitAgentReply),
            update_global_settings => UpdateGlobalSettings($crate::protocol::UpdateGlobalSettingsRequest, $crate::protocol::UpdateGlobalSettingsReply),
        }
    };
}

macro_rules! declare_remote_api {
    ($( $fn_name:ident => $msg:ident ($req:ty, $rep:ty) ),+ $(,)?) => {
        pub trait RemoteApi {
            $( fn $fn_name(&self, req: $req, cb: Callback<$rep>); )+
        }

        impl RemoteApi for StreamRemoteApi {
            $(
                fn $fn_name(&self, req: $req, cb: Callback<$rep>) {
                    self.send(MsgType::$msg, &req, cb);
                }
            )+
        }

        impl RemoteApi for NullRemoteApi {
            $(
                fn $fn_name(&self, _req: $req, cb: Callback<$rep>) {
                    self.queue.post(move || cb(Err(Error::NotConnected)));
                }
            )+
        }
    };
}

remote_api_methods!(declare_remote_api);

/// Placeholder installed while no connection exists; every call fails
/// with [`Error::NotConnected`] through the posted path.
pub struct NullRemoteApi {
    queue: EventQueue,
}

impl NullRemoteApi {
    pub fn new(queue: EventQueue) -> Self {
        Self { queue }
    }
}

struct PendingEntry {
    msg_type: MsgType,
    complete: Box<dyn FnOnce(Result<Vec<u8>, Error>)>,
}

/// Transaction-id allocation plus the id -> reply-callback correlation map.
/// Shared between the stream api (registration) and the session frame
/// dispatch (completion).
#[derive(Default)]
pub struct PendingReplies {
    next_transaction_id: Cell<u32>,
    map: RefCell<HashMap<u32, PendingEntry>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self {
            // id zero is the notification channel, never allocated
            next_transaction_id: Cell::new(1),
            map: RefCell::default(),
        }
    }

    pub(crate) fn alloc(&self) -> u32 {
        let id = self.next_transaction_id.get();
        self.next_transaction_id.set(id.wrapping_add(1).max(1));
        id
    }

    fn register(&self, id: u32, msg_type: MsgType, complete: Box<dyn FnOnce(Result<Vec<u8>, Error>)>) {
        let prev = self
            .map
            .borrow_mut()
            .insert(id, PendingEntry { msg_type, complete });
        debug_assert!(prev.is_none(), "transaction id collision");
    }

    /// Complete one pending transaction. Returns false when the id is
    /// unknown (late reply for an already-failed request): the caller
    /// drops the message with a warning, this is not fatal.
    pub fn complete(&self, id: u32, body: Result<Vec<u8>, Error>) -> bool {
        let entry = self.map.borrow_mut().remove(&id);
        match entry {
            Some(entry) => {
                (entry.complete)(body);
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.map.borrow().len()
    }

    /// Fail every in-flight request, used on connection teardown.
    pub fn fail_all(&self, err: impl Fn() -> Error) {
        let entries: Vec<_> = self.map.borrow_mut().drain().collect();
        for (id, entry) in entries {
            log::debug!(target: "session", "failing in-flight {} (transaction {id})", entry.msg_type);
            (entry.complete)(Err(err()));
        }
    }
}

/// Live-stream implementation: frames requests onto the write half of the
/// agent connection and correlates replies by transaction id.
pub struct StreamRemoteApi {
    queue: EventQueue,
    pending: std::rc::Rc<PendingReplies>,
    writer: RefCell<Box<dyn Write>>,
}

impl StreamRemoteApi {
    pub fn new(
        queue: EventQueue,
        pending: std::rc::Rc<PendingReplies>,
        writer: Box<dyn Write>,
    ) -> Self {
        Self {
            queue,
            pending,
            writer: RefCell::new(writer),
        }
    }

    fn send<Req: Serialize, Rep: DeserializeOwned + 'static>(
        &self,
        msg_type: MsgType,
        req: &Req,
        cb: Callback<Rep>,
    ) {
        let id = self.pending.alloc();
        let bytes = match codec::encode(msg_type, id, req) {
            Ok(frame) => frame,
            Err(e) => {
                self.queue.post(move || cb(Err(e)));
                return;
            }
        };

        self.pending.register(
            id,
            msg_type,
            Box::new(move |result| match result {
                Ok(body) => cb(codec::decode_body(&body)),
                Err(e) => cb(Err(e)),
            }),
        );
        log::debug!(target: "session", "sent {msg_type} (transaction {id}, {} bytes)", bytes.len());

        let write_result = {
            let mut writer = self.writer.borrow_mut();
            writer.write_all(&bytes).and_then(|_| writer.flush())
        };
        if let Err(e) = write_result {
            // complete through the posted path, like any other failure
            let pending = self.pending.clone();
            self.queue.post(move || {
                pending.complete(id, Err(Error::Io(e)));
            });
        }
    }
}
