//! Static descriptors for the syscall entry stubs the interception
//! workflow can hook.

use once_cell::sync::Lazy;
use regex::Regex;

/// One argument read at syscall entry. Arguments live in the `a0..a7`
/// registers; stack-passed arguments are not decoded.
#[derive(Debug, Clone, Copy)]
pub struct SyscallArg {
    pub name: &'static str,
}

#[derive(Debug)]
pub struct SyscallDescriptor {
    pub name: &'static str,
    pub args: &'static [SyscallArg],
    /// Whether the result matters: only then is an exit breakpoint
    /// installed to capture the return value.
    pub returns_value: bool,
}

impl SyscallDescriptor {
    /// Symbol of the vDSO entry stub the entry breakpoint lands on.
    pub fn entry_symbol(&self) -> String {
        format!("_sys_{}", self.name)
    }
}

macro_rules! arg {
    ($name:literal) => {
        SyscallArg { name: $name }
    };
}

macro_rules! syscall {
    ($name:literal, ret: $ret:literal, [$($arg:literal),* $(,)?]) => {
        SyscallDescriptor {
            name: $name,
            args: &[$(arg!($arg)),*],
            returns_value: $ret,
        }
    };
}

/// Everything the workflow knows how to intercept.
pub static SYSCALLS: Lazy<Vec<SyscallDescriptor>> = Lazy::new(|| {
    vec![
        syscall!("channel_create", ret: true, ["options", "out0", "out1"]),
        syscall!("channel_read", ret: true, ["handle", "options", "bytes", "handles"]),
        syscall!("channel_write", ret: true, ["handle", "options", "bytes", "num_bytes"]),
        syscall!("channel_call", ret: true, ["handle", "options", "deadline", "args"]),
        syscall!("socket_create", ret: true, ["options", "out0", "out1"]),
        syscall!("socket_read", ret: true, ["handle", "options", "buffer", "size"]),
        syscall!("socket_write", ret: true, ["handle", "options", "buffer", "size"]),
        syscall!("handle_close", ret: true, ["handle"]),
        syscall!("handle_duplicate", ret: true, ["handle", "rights", "out"]),
        syscall!("object_wait_one", ret: true, ["handle", "signals", "deadline"]),
        syscall!("object_wait_many", ret: true, ["items", "num_items", "deadline"]),
        syscall!("object_signal", ret: true, ["handle", "clear_mask", "set_mask"]),
        syscall!("port_create", ret: true, ["options", "out"]),
        syscall!("port_wait", ret: true, ["handle", "deadline", "packet"]),
        syscall!("port_queue", ret: true, ["handle", "packet"]),
        syscall!("process_create", ret: true, ["job", "name", "name_size", "options"]),
        syscall!("process_start", ret: true, ["handle", "thread", "entry", "stack"]),
        syscall!("thread_create", ret: true, ["process", "name", "name_size", "options"]),
        syscall!("thread_start", ret: true, ["handle", "entry", "stack", "arg1"]),
        syscall!("vmo_create", ret: true, ["size", "options", "out"]),
        syscall!("vmo_read", ret: true, ["handle", "buffer", "offset", "size"]),
        syscall!("vmo_write", ret: true, ["handle", "buffer", "offset", "size"]),
        syscall!("clock_get_monotonic", ret: true, []),
        syscall!("nanosleep", ret: true, ["deadline"]),
        // fire-and-forget calls, no exit breakpoint
        syscall!("thread_exit", ret: false, []),
        syscall!("process_exit", ret: false, ["retcode"]),
        syscall!("debug_write", ret: false, ["buffer", "size"]),
    ]
});

pub fn find(name: &str) -> Option<&'static SyscallDescriptor> {
    SYSCALLS.iter().find(|s| s.name == name)
}

/// Descriptors whose name matches the filter, or all of them without one.
pub fn matching(filter: Option<&Regex>) -> Vec<&'static SyscallDescriptor> {
    SYSCALLS
        .iter()
        .filter(|s| filter.map_or(true, |re| re.is_match(s.name)))
        .collect()
}
