//! Post-mortem snapshot backend.
//!
//! A snapshot is a json capture of processes, threads, stacks, register
//! banks, module lists and selected memory regions, written at crash
//! time by an external tool. Opening one puts the session into the same
//! state machine as a live connection, with this [`RemoteApi`] answering
//! the inspection subset from the file; execution-control and
//! breakpoint operations report [`Error::NotInSnapshot`].

use crate::protocol::{
    status, Arch, AttachKind, MemoryBlock, Module, ProcessDescription, RegisterValue, StackFrame,
    ThreadRecord,
};
use crate::session::error::Error;
use crate::session::exec::EventQueue;
use crate::session::remote::{Callback, RemoteApi};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotThread {
    pub record: ThreadRecord,
    #[serde(default)]
    pub frames: Vec<StackFrame>,
    #[serde(default)]
    pub registers: Vec<RegisterValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotRegion {
    pub address: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotProcess {
    pub process_id: u64,
    pub name: String,
    #[serde(default)]
    pub threads: Vec<SnapshotThread>,
    #[serde(default)]
    pub modules: Vec<Module>,
    #[serde(default)]
    pub memory: Vec<SnapshotRegion>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Snapshot {
    pub arch: Arch,
    pub processes: Vec<SnapshotProcess>,
}

pub struct SnapshotRemoteApi {
    queue: EventQueue,
    snapshot: Snapshot,
    threads_by_koid: HashMap<(u64, u64), SnapshotThread>,
}

impl SnapshotRemoteApi {
    pub fn load(queue: EventQueue, path: &Path) -> Result<Self, Error> {
        let data = std::fs::read(path)?;
        let snapshot: Snapshot = serde_json::from_slice(&data).map_err(Error::SnapshotParse)?;
        Ok(Self::new(queue, snapshot))
    }

    pub fn new(queue: EventQueue, snapshot: Snapshot) -> Self {
        let mut threads_by_koid = HashMap::new();
        for process in &snapshot.processes {
            for thread in &process.threads {
                threads_by_koid.insert((process.process_id, thread.record.thread_id), thread.clone());
            }
        }
        Self {
            queue,
            snapshot,
            threads_by_koid,
        }
    }

    pub fn arch(&self) -> Arch {
        self.snapshot.arch
    }

    fn process(&self, koid: u64) -> Option<&SnapshotProcess> {
        self.snapshot.processes.iter().find(|p| p.process_id == koid)
    }

    fn post<T: 'static>(&self, cb: Callback<T>, result: Result<T, Error>) {
        self.queue.post(move || cb(result));
    }
}

/// Operations that have no meaning against a dead capture.
macro_rules! not_in_snapshot {
    ($( $fn_name:ident ($req:ty, $rep:ty) ),+ $(,)?) => {
        $(
            fn $fn_name(&self, _req: $req, cb: Callback<$rep>) {
                self.post(cb, Err(Error::NotInSnapshot));
            }
        )+
    };
}

impl RemoteApi for SnapshotRemoteApi {
    fn hello(
        &self,
        _req: crate::protocol::HelloRequest,
        cb: Callback<crate::protocol::HelloReply>,
    ) {
        let reply = crate::protocol::HelloReply {
            magic: crate::protocol::HELLO_MAGIC,
            version: crate::protocol::PROTOCOL_VERSION,
            arch: self.snapshot.arch,
            page_size: 4096,
        };
        self.post(cb, Ok(reply));
    }

    fn attach(
        &self,
        req: crate::protocol::AttachRequest,
        cb: Callback<crate::protocol::AttachReply>,
    ) {
        let reply = match (req.kind, self.process(req.koid)) {
            (AttachKind::Process, Some(process)) => crate::protocol::AttachReply {
                status: status::OK,
                name: process.name.clone(),
            },
            _ => crate::protocol::AttachReply {
                status: status::ERR_NOT_FOUND,
                name: String::new(),
            },
        };
        self.post(cb, Ok(reply));
    }

    fn detach(
        &self,
        _req: crate::protocol::DetachRequest,
        cb: Callback<crate::protocol::DetachReply>,
    ) {
        self.post(cb, Ok(crate::protocol::DetachReply { status: status::OK }));
    }

    fn status(
        &self,
        _req: crate::protocol::StatusRequest,
        cb: Callback<crate::protocol::StatusReply>,
    ) {
        let processes = self
            .snapshot
            .processes
            .iter()
            .map(|p| ProcessDescription {
                process_id: p.process_id,
                name: p.name.clone(),
                components: Vec::new(),
            })
            .collect();
        self.post(
            cb,
            Ok(crate::protocol::StatusReply {
                processes,
                limbo: Vec::new(),
            }),
        );
    }

    fn process_status(
        &self,
        req: crate::protocol::ProcessStatusRequest,
        cb: Callback<crate::protocol::ProcessStatusReply>,
    ) {
        let reply = match self.process(req.process_id) {
            Some(p) => crate::protocol::ProcessStatusReply {
                status: status::OK,
                record: ProcessDescription {
                    process_id: p.process_id,
                    name: p.name.clone(),
                    components: Vec::new(),
                },
            },
            None => crate::protocol::ProcessStatusReply {
                status: status::ERR_NOT_FOUND,
                record: ProcessDescription::default(),
            },
        };
        self.post(cb, Ok(reply));
    }

    fn threads(
        &self,
        req: crate::protocol::ThreadsRequest,
        cb: Callback<crate::protocol::ThreadsReply>,
    ) {
        let threads = self
            .process(req.process_id)
            .map(|p| p.threads.iter().map(|t| t.record.clone()).collect())
            .unwrap_or_default();
        self.post(cb, Ok(crate::protocol::ThreadsReply { threads }));
    }

    fn thread_status(
        &self,
        req: crate::protocol::ThreadStatusRequest,
        cb: Callback<crate::protocol::ThreadStatusReply>,
    ) {
        let reply = match self.threads_by_koid.get(&(req.process_id, req.thread_id)) {
            Some(thread) => Ok(crate::protocol::ThreadStatusReply {
                record: thread.record.clone(),
                frames: thread.frames.clone(),
            }),
            None => Err(Error::ThreadNotFound(req.thread_id)),
        };
        self.post(cb, reply);
    }

    fn modules(
        &self,
        req: crate::protocol::ModulesRequest,
        cb: Callback<crate::protocol::ModulesReply>,
    ) {
        let modules = self
            .process(req.process_id)
            .map(|p| p.modules.clone())
            .unwrap_or_default();
        self.post(cb, Ok(crate::protocol::ModulesReply { modules }));
    }

    fn read_memory(
        &self,
        req: crate::protocol::ReadMemoryRequest,
        cb: Callback<crate::protocol::ReadMemoryReply>,
    ) {
        let block = self.process(req.process_id).and_then(|p| {
            p.memory.iter().find_map(|region| {
                let end = region.address + region.data.len() as u64;
                if req.address >= region.address && req.address + req.size as u64 <= end {
                    let offset = (req.address - region.address) as usize;
                    Some(MemoryBlock {
                        address: req.address,
                        valid: true,
                        data: region.data[offset..offset + req.size as usize].to_vec(),
                    })
                } else {
                    None
                }
            })
        });
        let blocks = vec![block.unwrap_or(MemoryBlock {
            address: req.address,
            valid: false,
            data: Vec::new(),
        })];
        self.post(cb, Ok(crate::protocol::ReadMemoryReply { blocks }));
    }

    fn read_registers(
        &self,
        req: crate::protocol::ReadRegistersRequest,
        cb: Callback<crate::protocol::ReadRegistersReply>,
    ) {
        let registers = self
            .threads_by_koid
            .get(&(req.process_id, req.thread_id))
            .map(|t| t.registers.clone())
            .unwrap_or_default();
        self.post(cb, Ok(crate::protocol::ReadRegistersReply { registers }));
    }

    fn sys_info(
        &self,
        _req: crate::protocol::SysInfoRequest,
        cb: Callback<crate::protocol::SysInfoReply>,
    ) {
        self.post(
            cb,
            Ok(crate::protocol::SysInfoReply {
                version: "snapshot".into(),
                num_cpus: 0,
                memory_mb: 0,
            }),
        );
    }

    fn address_space(
        &self,
        req: crate::protocol::AddressSpaceRequest,
        cb: Callback<crate::protocol::AddressSpaceReply>,
    ) {
        let regions = self
            .process(req.process_id)
            .map(|p| {
                p.memory
                    .iter()
                    .map(|r| crate::protocol::AddressRegion {
                        name: String::new(),
                        base: r.address,
                        size: r.data.len() as u64,
                    })
                    .collect()
            })
            .unwrap_or_default();
        self.post(cb, Ok(crate::protocol::AddressSpaceReply { regions }));
    }

    not_in_snapshot! {
        launch(crate::protocol::LaunchRequest, crate::protocol::LaunchReply),
        kill(crate::protocol::KillRequest, crate::protocol::KillReply),
        pause(crate::protocol::PauseRequest, crate::protocol::PauseReply),
        resume(crate::protocol::ResumeRequest, crate::protocol::ResumeReply),
        process_tree(crate::protocol::ProcessTreeRequest, crate::protocol::ProcessTreeReply),
        write_memory(crate::protocol::WriteMemoryRequest, crate::protocol::WriteMemoryReply),
        write_registers(crate::protocol::WriteRegistersRequest, crate::protocol::WriteRegistersReply),
        add_or_change_breakpoint(crate::protocol::AddOrChangeBreakpointRequest, crate::protocol::AddOrChangeBreakpointReply),
        remove_breakpoint(crate::protocol::RemoveBreakpointRequest, crate::protocol::RemoveBreakpointReply),
        update_filter(crate::protocol::UpdateFilterRequest, crate::protocol::UpdateFilterReply),
        load_info_handle_table(crate::protocol::LoadInfoHandleTableRequest, crate::protocol::LoadInfoHandleTableReply),
        config_agent(crate::protocol::ConfigAgentRequest, crate::protocol::ConfigAgentReply),
        quit_agent(crate::protocol::QuitAgentRequest, crate::protocol::QuitAgentReply),
        update_global_settings(crate::protocol::UpdateGlobalSettingsRequest, crate::protocol::UpdateGlobalSettingsReply),
    }
}
