//! Thread controllers: pluggable policies that decide, on each stop,
//! whether the thread halts for the user or transparently resumes.
//! Stepping, "run until" and "finish" are all controllers layered on the
//! arbitration in [`crate::session::thread::Thread::on_exception`].

use crate::protocol::ExceptionType;
use crate::session::breakpoint::Breakpoint;
use crate::session::error::Error;
use crate::session::symbols::InputLocation;
use crate::session::system::System;
use crate::session::thread::Thread;
use std::ops::Range;
use std::rc::{Rc, Weak};

/// One controller's verdict for a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOp {
    /// Keep running as far as this controller is concerned.
    Continue,
    /// Stop; the controller finished its job and is removed.
    StopDone,
    /// The stop is none of this controller's business; no vote either way
    /// and the controller stays installed.
    Unexpected,
}

/// How the topmost controller wants the thread resumed.
#[derive(Debug, Clone, PartialEq)]
pub enum ContinueOp {
    /// Plain continue, exception resolved.
    Default,
    /// Single instruction step.
    StepInstruction,
    /// Run while the instruction pointer stays inside the range.
    StepInRange(Range<u64>),
    /// No agent round trip: immediately re-dispatch a synthetic stop so
    /// the controller stack can conclude locally.
    SyntheticStop,
}

pub trait ThreadController {
    fn name(&self) -> &'static str;

    /// Vote on a stop. `hits` carries every live hit breakpoint,
    /// including internal ones, so controllers can recognize their own
    /// scaffolding.
    fn on_thread_stop(&mut self, exception: ExceptionType, hits: &[Rc<Breakpoint>]) -> StopOp;

    /// Resume mode. Only consulted for the most recently pushed
    /// controller on the stack.
    fn continue_op(&self) -> ContinueOp;
}

/// Steps while the instruction pointer stays inside an address range
/// (one source line, typically).
pub struct StepInRangeController {
    thread: Weak<Thread>,
    range: Range<u64>,
}

impl StepInRangeController {
    pub fn new(thread: &Rc<Thread>, range: Range<u64>) -> Self {
        Self {
            thread: Rc::downgrade(thread),
            range,
        }
    }

    fn ip(&self) -> Option<u64> {
        self.thread.upgrade().and_then(|t| t.top_ip())
    }
}

impl ThreadController for StepInRangeController {
    fn name(&self) -> &'static str {
        "step-in-range"
    }

    fn on_thread_stop(&mut self, exception: ExceptionType, _hits: &[Rc<Breakpoint>]) -> StopOp {
        match exception {
            ExceptionType::SingleStep | ExceptionType::Synthetic => match self.ip() {
                Some(ip) if self.range.contains(&ip) => StopOp::Continue,
                _ => StopOp::StopDone,
            },
            // breakpoints and faults inside the range are someone else's stop
            _ => StopOp::Unexpected,
        }
    }

    fn continue_op(&self) -> ContinueOp {
        match self.ip() {
            // already out of the range, conclude without a round trip
            Some(ip) if !self.range.contains(&ip) => ContinueOp::SyntheticStop,
            _ => ContinueOp::StepInRange(self.range.clone()),
        }
    }
}

/// Runs to a fixed address via an internal one-shot-style breakpoint that
/// is removed when the controller dies.
pub struct UntilController {
    system: Weak<System>,
    thread: Weak<Thread>,
    address: u64,
    breakpoint: Rc<Breakpoint>,
}

impl UntilController {
    pub fn new(system: &Rc<System>, thread: &Rc<Thread>, address: u64) -> Self {
        let breakpoint = system.create_new_internal_breakpoint();
        {
            let mut settings = breakpoint.settings();
            settings.locations = vec![InputLocation::Address(address)];
            settings.scope = crate::session::breakpoint::BreakpointScope::Thread(Rc::downgrade(thread));
            breakpoint.set_settings(settings);
        }
        Self {
            system: Rc::downgrade(system),
            thread: Rc::downgrade(thread),
            address,
            breakpoint,
        }
    }

    pub fn breakpoint(&self) -> &Rc<Breakpoint> {
        &self.breakpoint
    }
}

impl ThreadController for UntilController {
    fn name(&self) -> &'static str {
        "until"
    }

    fn on_thread_stop(&mut self, _exception: ExceptionType, hits: &[Rc<Breakpoint>]) -> StopOp {
        let mine = hits.iter().any(|b| Rc::ptr_eq(b, &self.breakpoint));
        let at_address = self
            .thread
            .upgrade()
            .and_then(|t| t.top_ip())
            .is_some_and(|ip| ip == self.address);
        if mine || at_address {
            StopOp::StopDone
        } else {
            StopOp::Unexpected
        }
    }

    fn continue_op(&self) -> ContinueOp {
        ContinueOp::Default
    }
}

impl Drop for UntilController {
    fn drop(&mut self) {
        if let Some(system) = self.system.upgrade() {
            system.delete_breakpoint_quiet(&self.breakpoint);
        }
    }
}

/// Runs until the current frame returns: an until-controller targeting
/// the caller's instruction pointer, with a stack-depth guard so a
/// recursive re-entry of the same address does not finish early.
pub struct FinishController {
    until: UntilController,
    thread: Weak<Thread>,
    /// CFA of the frame being finished; the return site only counts when
    /// the stack has unwound past it.
    frame_cfa: u64,
}

impl FinishController {
    /// The thread's stack must be synced deep enough to know the caller.
    pub fn new(system: &Rc<System>, thread: &Rc<Thread>) -> Result<Self, Error> {
        let frames = thread.frames();
        let (current, caller) = match (frames.first(), frames.get(1)) {
            (Some(c), Some(r)) => (*c, *r),
            _ => return Err(Error::NoStackFrames),
        };
        Ok(Self {
            until: UntilController::new(system, thread, caller.ip),
            thread: Rc::downgrade(thread),
            frame_cfa: current.cfa,
        })
    }
}

impl ThreadController for FinishController {
    fn name(&self) -> &'static str {
        "finish"
    }

    fn on_thread_stop(&mut self, exception: ExceptionType, hits: &[Rc<Breakpoint>]) -> StopOp {
        match self.until.on_thread_stop(exception, hits) {
            StopOp::StopDone => {
                let unwound = self
                    .thread
                    .upgrade()
                    .and_then(|t| t.frames().first().map(|f| f.sp))
                    .is_some_and(|sp| sp >= self.frame_cfa);
                if unwound {
                    StopOp::StopDone
                } else {
                    // recursed back into the return site, keep going
                    StopOp::Continue
                }
            }
            other => other,
        }
    }

    fn continue_op(&self) -> ContinueOp {
        self.until.continue_op()
    }
}
