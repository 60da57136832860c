//! Observer interfaces the session core exposes to its clients (a console
//! front end, the interception workflow, tests).
//!
//! Fan-out is always performed over a snapshot copy of the observer list,
//! so an observer may register/unregister observers or create/delete
//! session objects while being notified.

use crate::protocol::{IoKind, Koid, ProcessDescription};
use crate::session::breakpoint::Breakpoint;
use crate::session::error::Error;
use crate::session::filter::Filter;
use crate::session::job::JobContext;
use crate::session::process::Process;
use crate::session::target::Target;
use crate::session::thread::Thread;
use std::cell::RefCell;
use std::rc::Rc;

/// Session-level connection events.
pub trait SessionObserver {
    fn on_connected(&self) {}
    fn on_disconnected(&self) {}
    /// Non-fatal session-wide warning (e.g. a reply with no pending entry).
    fn on_session_warning(&self, _msg: &str) {}
    /// Fatal connection error, the stream has been torn down.
    fn on_session_error(&self, _err: &Error) {}
    /// Processes the agent was already attached to when we connected.
    fn on_previously_attached(&self, _processes: &[ProcessDescription]) {}
    /// A crashed process is held in limbo awaiting a debugger.
    fn on_process_in_limbo(&self, _process: &ProcessDescription) {}
}

/// System registry churn.
pub trait SystemObserver {
    fn on_breakpoint_created(&self, _breakpoint: &Rc<Breakpoint>) {}
    fn on_breakpoint_will_be_deleted(&self, _breakpoint: &Rc<Breakpoint>) {}
    /// Fired on the 0 -> 1 edge of in-flight downloads.
    fn on_downloads_started(&self) {}
    /// Fired on the 1 -> 0 edge with aggregate counts.
    fn on_downloads_stopped(&self, _success: usize, _fail: usize) {}
}

pub trait TargetObserver {
    fn on_target_created(&self, _target: &Rc<Target>) {}
    fn on_will_destroy_target(&self, _target: &Rc<Target>) {}
}

pub trait ProcessObserver {
    fn on_process_created(&self, _process: &Rc<Process>) {}
    fn on_will_destroy_process(&self, _process: &Rc<Process>) {}
    fn on_thread_created(&self, _thread: &Rc<Thread>) {}
    fn on_thread_will_be_destroyed(&self, _thread: &Rc<Thread>) {}
    fn on_modules_loaded(&self, _process: &Rc<Process>) {}
    fn on_modules_will_unload(&self, _process: &Rc<Process>) {}
    fn on_symbol_load_failure(&self, _process: &Rc<Process>, _err: &Error) {}
    fn on_io(&self, _process: &Rc<Process>, _kind: IoKind, _data: &[u8]) {}
}

pub trait ThreadObserver {
    /// The thread halted and the stop survived controller arbitration.
    /// `hits` carries only live, user-visible breakpoints.
    fn on_thread_stopped(
        &self,
        _thread: &Rc<Thread>,
        _exception: crate::protocol::ExceptionType,
        _hits: &[Rc<Breakpoint>],
    ) {
    }
    fn on_thread_frames_invalidated(&self, _thread: &Rc<Thread>) {}
}

pub trait BreakpointObserver {
    /// Locations were (re)resolved; `user_requested` when triggered by a
    /// settings change rather than a module load.
    fn on_breakpoint_matched(&self, _breakpoint: &Rc<Breakpoint>, _user_requested: bool) {}
    fn on_breakpoint_update_failure(&self, _breakpoint: &Rc<Breakpoint>, _err: &Error) {}
}

pub trait FilterObserver {
    fn on_filter_created(&self, _filter: &Rc<Filter>) {}
    fn on_filter_changed(&self, _filter: &Rc<Filter>) {}
    fn on_filter_will_be_deleted(&self, _filter: &Rc<Filter>) {}
    fn on_filter_matches(&self, _job: Option<&Rc<JobContext>>, _pids: &[Koid]) {}
}

struct List<T: ?Sized>(RefCell<Vec<Rc<T>>>);

impl<T: ?Sized> Default for List<T> {
    fn default() -> Self {
        Self(RefCell::new(Vec::new()))
    }
}

impl<T: ?Sized> List<T> {
    fn add(&self, observer: Rc<T>) {
        self.0.borrow_mut().push(observer);
    }

    fn remove(&self, observer: &Rc<T>) {
        self.0.borrow_mut().retain(|o| !Rc::ptr_eq(o, observer));
    }

    /// Snapshot-copy fan-out, tolerant of mutation during iteration.
    fn for_each(&self, f: impl Fn(&Rc<T>)) {
        let snapshot: Vec<_> = self.0.borrow().clone();
        for observer in &snapshot {
            f(observer);
        }
    }
}

/// All observer registries, shared by the session objects.
#[derive(Default)]
pub struct Observers {
    session: List<dyn SessionObserver>,
    system: List<dyn SystemObserver>,
    target: List<dyn TargetObserver>,
    process: List<dyn ProcessObserver>,
    thread: List<dyn ThreadObserver>,
    breakpoint: List<dyn BreakpointObserver>,
    filter: List<dyn FilterObserver>,
}

macro_rules! registry {
    ($field:ident, $trait:ident, $add:ident, $remove:ident, $notify:ident) => {
        pub fn $add(&self, observer: Rc<dyn $trait>) {
            self.$field.add(observer);
        }
        pub fn $remove(&self, observer: &Rc<dyn $trait>) {
            self.$field.remove(observer);
        }
        pub fn $notify(&self, f: impl Fn(&Rc<dyn $trait>)) {
            self.$field.for_each(f);
        }
    };
}

impl Observers {
    registry!(session, SessionObserver, add_session, remove_session, notify_session);
    registry!(system, SystemObserver, add_system, remove_system, notify_system);
    registry!(target, TargetObserver, add_target, remove_target, notify_target);
    registry!(process, ProcessObserver, add_process, remove_process, notify_process);
    registry!(thread, ThreadObserver, add_thread, remove_thread, notify_thread);
    registry!(
        breakpoint,
        BreakpointObserver,
        add_breakpoint,
        remove_breakpoint,
        notify_breakpoint
    );
    registry!(filter, FilterObserver, add_filter, remove_filter, notify_filter);
}
