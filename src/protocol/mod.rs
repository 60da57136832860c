//! Wire protocol surface between the client and a remote debug agent.
//!
//! Every exchange is a frame: a fixed-size header ([`codec::Header`])
//! followed by a `serde_json` serialized body. Requests carry a nonzero
//! transaction id and receive exactly one reply with the same id;
//! transaction id zero is reserved for agent-initiated notifications.

pub mod codec;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, FromRepr};

/// Kernel object id: the stable integer the agent uses to identify one
/// process, thread or job across all messages.
pub type Koid = u64;

/// Protocol version compiled into this client. The agent must report
/// exactly this version in its hello reply, there is no negotiation.
pub const PROTOCOL_VERSION: u32 = 7;

/// Signature expected in a hello reply body.
pub const HELLO_MAGIC: u32 = 0x7e7e_a9d1;

/// Agent status codes embedded in reply bodies. Zero is success, anything
/// else is translated into a human readable message by the caller.
pub mod status {
    pub const OK: i32 = 0;
    /// Target object already bound to another client (attach races).
    pub const ERR_ALREADY_BOUND: i32 = -10;
    /// I/O failure, on launch this means the binary was not found.
    pub const ERR_IO: i32 = -40;
    pub const ERR_NOT_FOUND: i32 = -25;
    pub const ERR_BAD_STATE: i32 = -20;
}

/// Message type discriminator carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u32)]
pub enum MsgType {
    Hello = 1,
    Launch = 2,
    Kill = 3,
    Attach = 4,
    Detach = 5,
    Modules = 6,
    Pause = 7,
    Resume = 8,
    ProcessTree = 9,
    Threads = 10,
    ReadMemory = 11,
    WriteMemory = 12,
    ReadRegisters = 13,
    WriteRegisters = 14,
    AddOrChangeBreakpoint = 15,
    RemoveBreakpoint = 16,
    SysInfo = 17,
    Status = 18,
    ProcessStatus = 19,
    ThreadStatus = 20,
    AddressSpace = 21,
    UpdateFilter = 22,
    LoadInfoHandleTable = 23,
    ConfigAgent = 24,
    QuitAgent = 25,
    UpdateGlobalSettings = 26,

    NotifyProcessStarting = 100,
    NotifyProcessExiting = 101,
    NotifyThreadStarting = 102,
    NotifyThreadExiting = 103,
    NotifyException = 104,
    NotifyModules = 105,
    NotifyIO = 106,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum Arch {
    X64,
    Arm64,
}

// ---------------------------------- handshake ------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HelloRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloReply {
    pub magic: u32,
    pub version: u32,
    pub arch: Arch,
    pub page_size: u64,
}

// ---------------------------------- process lifecycle ----------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchReply {
    pub status: i32,
    pub process_id: Koid,
    pub process_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KillRequest {
    pub process_id: Koid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KillReply {
    pub status: i32,
}

/// What kind of object an attach request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum AttachKind {
    Process,
    Job,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachRequest {
    pub kind: AttachKind,
    pub koid: Koid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttachReply {
    pub status: i32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachRequest {
    pub kind: AttachKind,
    pub koid: Koid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetachReply {
    pub status: i32,
}

// ---------------------------------- inspection -----------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub base: u64,
    pub build_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModulesRequest {
    pub process_id: Koid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModulesReply {
    pub modules: Vec<Module>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum ThreadState {
    New,
    Running,
    Suspended,
    Blocked,
    CoreDump,
    Dying,
    Dead,
}

impl Default for ThreadState {
    fn default() -> Self {
        ThreadState::Running
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub process_id: Koid,
    pub thread_id: Koid,
    pub name: String,
    pub state: ThreadState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadsRequest {
    pub process_id: Koid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadsReply {
    pub threads: Vec<ThreadRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryBlock {
    pub address: u64,
    pub valid: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadMemoryRequest {
    pub process_id: Koid,
    pub address: u64,
    pub size: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadMemoryReply {
    pub blocks: Vec<MemoryBlock>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteMemoryRequest {
    pub process_id: Koid,
    pub address: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteMemoryReply {
    pub status: i32,
}

/// One register value. Which registers exist is architecture specific,
/// the client treats names as opaque except for the few named below.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterValue {
    pub name: String,
    pub value: u64,
}

/// Register names with protocol-level meaning.
pub mod regs {
    /// Instruction pointer.
    pub const IP: &str = "ip";
    /// Stack pointer.
    pub const SP: &str = "sp";
    /// Return address slot (link register or first stack slot).
    pub const RA: &str = "ra";
    /// First eight argument registers are named a0..a7.
    pub fn arg(n: usize) -> String {
        format!("a{n}")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadRegistersRequest {
    pub process_id: Koid,
    pub thread_id: Koid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadRegistersReply {
    pub registers: Vec<RegisterValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteRegistersRequest {
    pub process_id: Koid,
    pub thread_id: Koid,
    pub registers: Vec<RegisterValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteRegistersReply {
    pub status: i32,
}

// ---------------------------------- execution control ----------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PauseRequest {
    pub process_id: Koid,
    /// Zero means "all threads of the process".
    pub thread_id: Koid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PauseReply {
    pub status: i32,
}

/// How a thread should be resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum ResumeHow {
    /// Resolve the exception (the agent considers it handled) and run.
    ResolveAndContinue,
    /// Pass the exception to the next handler in the target and run.
    ForwardAndContinue,
    /// Execute one instruction, then raise a single-step exception.
    StepInstruction,
    /// Run while the instruction pointer stays inside `[range_begin, range_end)`.
    StepInRange,
}

impl Default for ResumeHow {
    fn default() -> Self {
        ResumeHow::ResolveAndContinue
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub process_id: Koid,
    /// Empty means "all threads of the process".
    pub thread_ids: Vec<Koid>,
    pub how: ResumeHow,
    pub range_begin: u64,
    pub range_end: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeReply {
    pub status: i32,
}

// ---------------------------------- breakpoints ----------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum BreakpointType {
    Software,
    Hardware,
    Write,
    ReadWrite,
}

impl Default for BreakpointType {
    fn default() -> Self {
        BreakpointType::Software
    }
}

/// What execution should halt when a breakpoint is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum StopMode {
    /// Count the hit, never stop (transparent instrumentation).
    None,
    /// Stop the hitting thread only.
    Thread,
    /// Stop every thread of the hitting process.
    Process,
    /// Stop every attached process.
    All,
}

impl Default for StopMode {
    fn default() -> Self {
        StopMode::All
    }
}

/// One installed location of a breakpoint in a concrete process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakpointLocation {
    pub process_id: Koid,
    /// Zero means "all threads".
    pub thread_id: Koid,
    pub address: u64,
}

/// Breakpoint description as the agent sees it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentBreakpoint {
    pub id: u32,
    pub one_shot: bool,
    pub r#type: BreakpointType,
    pub stop: StopMode,
    pub locations: Vec<BreakpointLocation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddOrChangeBreakpointRequest {
    pub breakpoint: AgentBreakpoint,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddOrChangeBreakpointReply {
    pub status: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoveBreakpointRequest {
    pub breakpoint_id: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoveBreakpointReply {
    pub status: i32,
}

// ---------------------------------- agent state ----------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SysInfoRequest {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SysInfoReply {
    pub version: String,
    pub num_cpus: u32,
    pub memory_mb: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusRequest {}

/// Agent-side view of one process, reported by status and process-status
/// replies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessDescription {
    pub process_id: Koid,
    pub name: String,
    pub components: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusReply {
    /// Processes the agent is already attached to.
    pub processes: Vec<ProcessDescription>,
    /// Crashed processes held in limbo, waiting for a debugger.
    pub limbo: Vec<ProcessDescription>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessStatusRequest {
    pub process_id: Koid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessStatusReply {
    pub status: i32,
    pub record: ProcessDescription,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackFrame {
    pub ip: u64,
    pub sp: u64,
    pub cfa: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadStatusRequest {
    pub process_id: Koid,
    pub thread_id: Koid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadStatusReply {
    pub record: ThreadRecord,
    /// Full backtrace, top frame first.
    pub frames: Vec<StackFrame>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressRegion {
    pub name: String,
    pub base: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressSpaceRequest {
    pub process_id: Koid,
    pub address: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressSpaceReply {
    pub regions: Vec<AddressRegion>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessTreeRequest {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessTreeRecord {
    pub is_job: bool,
    pub koid: Koid,
    pub name: String,
    pub children: Vec<ProcessTreeRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessTreeReply {
    pub root: ProcessTreeRecord,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateFilterRequest {
    /// Zero means the filter set applies agent-wide, otherwise a job koid.
    pub job_id: Koid,
    /// Flattened patterns; an empty string matches every process.
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateFilterReply {
    pub status: i32,
    /// Koids of live processes that already match the new filter set.
    pub matched_processes: Vec<Koid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandleInfo {
    pub koid: Koid,
    pub r#type: String,
    pub rights: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadInfoHandleTableRequest {
    pub process_id: Koid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadInfoHandleTableReply {
    pub status: i32,
    pub handles: Vec<HandleInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigAgentRequest {
    /// Key/value settings applied on the agent side.
    pub actions: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigAgentReply {
    pub status: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuitAgentRequest {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuitAgentReply {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateGlobalSettingsRequest {
    /// Exception types the agent should hand to the client as second-chance.
    pub exception_strategies: Vec<(ExceptionType, bool)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateGlobalSettingsReply {
    pub status: i32,
}

// ---------------------------------- notifications --------------------------------------------

/// How a process announced by the agent entered the debugging session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum NotifyProcessKind {
    /// The agent launched it on our behalf.
    Launch,
    /// A filter matched it and the agent auto-attached.
    Attach,
    /// It crashed and sits in limbo awaiting a debugger.
    Limbo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyProcessStarting {
    pub kind: NotifyProcessKind,
    pub process_id: Koid,
    pub name: String,
    /// Component moniker when the launch was component based.
    pub component: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyProcessExiting {
    pub process_id: Koid,
    pub return_code: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyThread {
    pub record: ThreadRecord,
}

/// Exception class reported with a thread stop.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, FromRepr,
)]
#[repr(u32)]
pub enum ExceptionType {
    /// Software breakpoint instruction.
    SoftwareBreakpoint = 0,
    /// Hardware breakpoint register hit.
    HardwareBreakpoint = 1,
    /// Watchpoint (data breakpoint) hit.
    Watchpoint = 2,
    /// Single-step completion.
    SingleStep = 3,
    /// Synthesized locally by the client, never sent by the agent.
    Synthetic = 4,
    /// Generic fault.
    General = 5,
    PageFault = 6,
    UndefinedInstruction = 7,
    UnalignedAccess = 8,
    PolicyError = 9,
}

impl ExceptionType {
    /// Deliberate debug traps as opposed to program faults. Faults always
    /// stop regardless of what thread controllers vote.
    pub fn is_debug(&self) -> bool {
        matches!(
            self,
            ExceptionType::SoftwareBreakpoint
                | ExceptionType::HardwareBreakpoint
                | ExceptionType::Watchpoint
                | ExceptionType::SingleStep
                | ExceptionType::Synthetic
        )
    }

    /// True for exception types produced by breakpoint machinery, the only
    /// classes a conditional-breakpoint filter applies to.
    pub fn is_breakpoint(&self) -> bool {
        matches!(
            self,
            ExceptionType::SoftwareBreakpoint
                | ExceptionType::HardwareBreakpoint
                | ExceptionType::Watchpoint
        )
    }
}

/// Per-breakpoint statistics attached to an exception notification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakpointStats {
    pub id: u32,
    pub hit_count: u32,
    /// Set when the agent already removed the breakpoint (one-shot fired);
    /// the client must tear down its object without sending a remove.
    pub should_delete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyException {
    pub process_id: Koid,
    pub thread: ThreadRecord,
    pub r#type: ExceptionType,
    /// Top frames known at stop time (may be partial).
    pub frames: Vec<StackFrame>,
    pub hit_breakpoints: Vec<BreakpointStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyModules {
    pub process_id: Koid,
    pub modules: Vec<Module>,
    /// Threads the agent paused for the module load.
    pub stopped_threads: Vec<Koid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum IoKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyIO {
    pub process_id: Koid,
    pub kind: IoKind,
    pub data: Vec<u8>,
}
