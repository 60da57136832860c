//! Live thread object and the stop/continue arbitration at the heart of
//! the session: an ordered stack of [`ThreadController`]s votes on every
//! exception, and the verdict decides between notifying observers and a
//! transparent resume.

use crate::protocol::{
    ExceptionType, Koid, PauseRequest, ResumeHow, ResumeRequest, StackFrame, ThreadRecord,
    ThreadState, ThreadStatusRequest,
};
use crate::session::breakpoint::Breakpoint;
use crate::session::controller::{ContinueOp, StopOp, ThreadController};
use crate::session::process::Process;
use crate::session::remote::Callback;
use crate::session::stack::{Frame, Stack};
use crate::session::SessionLink;
use crate::weak_error;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::mem;
use std::rc::{Rc, Weak};

pub struct Thread {
    me: Weak<Thread>,
    link: Rc<SessionLink>,
    process: Weak<Process>,
    process_koid: Koid,
    koid: Koid,
    name: RefCell<String>,
    state: Cell<ThreadState>,
    stack: RefCell<Stack>,
    /// Most recently pushed last; `last()` is the authority for the next
    /// continue decision.
    controllers: RefCell<Vec<Box<dyn ThreadController>>>,
}

impl Thread {
    pub(crate) fn new(
        link: Rc<SessionLink>,
        process: &Rc<Process>,
        record: &ThreadRecord,
    ) -> Rc<Thread> {
        Rc::new_cyclic(|me| Thread {
            me: me.clone(),
            link,
            process: Rc::downgrade(process),
            process_koid: process.koid(),
            koid: record.thread_id,
            name: RefCell::new(record.name.clone()),
            state: Cell::new(record.state),
            stack: RefCell::new(Stack::default()),
            controllers: RefCell::new(Vec::new()),
        })
    }

    pub fn koid(&self) -> Koid {
        self.koid
    }

    pub fn process_koid(&self) -> Koid {
        self.process_koid
    }

    pub fn process(&self) -> Option<Rc<Process>> {
        self.process.upgrade()
    }

    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    pub fn state(&self) -> ThreadState {
        self.state.get()
    }

    pub(crate) fn set_metadata(&self, record: &ThreadRecord) {
        debug_assert_eq!(record.thread_id, self.koid);
        *self.name.borrow_mut() = record.name.clone();
        self.state.set(record.state);
    }

    // ------------------------------ stack ----------------------------------------------------

    pub fn frames(&self) -> Vec<Frame> {
        self.stack.borrow().frames().to_vec()
    }

    pub fn top_ip(&self) -> Option<u64> {
        self.stack.borrow().top_ip()
    }

    pub fn has_all_frames(&self) -> bool {
        self.stack.borrow().has_all_frames()
    }

    pub(crate) fn set_frames(&self, frames: &[StackFrame], complete: bool) {
        self.stack.borrow_mut().set_frames(frames, complete);
    }

    /// Fetch the complete backtrace from the agent.
    pub fn sync_frames(&self, cb: Callback<()>) {
        let me = self.me.clone();
        self.link.remote().thread_status(
            ThreadStatusRequest {
                process_id: self.process_koid,
                thread_id: self.koid,
            },
            Box::new(move |result| {
                let Some(thread) = me.upgrade() else {
                    cb(Err(crate::session::error::Error::ObjectGone("thread")));
                    return;
                };
                match result {
                    Ok(reply) => {
                        thread.set_metadata(&reply.record);
                        thread.set_frames(&reply.frames, true);
                        cb(Ok(()))
                    }
                    Err(e) => cb(Err(e)),
                }
            }),
        );
    }

    /// Drop cached frames; the invalidation event is suppressed when
    /// nothing was cached.
    pub(crate) fn clear_frames(&self) {
        if self.stack.borrow().is_empty() {
            return;
        }
        self.stack.borrow_mut().clear();
        if let Some(me) = self.me.upgrade() {
            self.link
                .observers()
                .notify_thread(|o| o.on_thread_frames_invalidated(&me));
        }
    }

    // ------------------------------ controllers ----------------------------------------------

    pub fn push_controller(&self, controller: Box<dyn ThreadController>) {
        log::debug!(
            target: "thread",
            "thread {}: install controller `{}`",
            self.koid,
            controller.name()
        );
        self.controllers.borrow_mut().push(controller);
    }

    /// Install a controller and resume under its policy.
    pub fn continue_with(&self, controller: Box<dyn ThreadController>) {
        self.push_controller(controller);
        self.continue_(false);
    }

    pub fn controller_count(&self) -> usize {
        self.controllers.borrow().len()
    }

    // ------------------------------ stop arbitration ------------------------------------------

    /// Arbitrate one exception. Policy, in order:
    /// an empty stack force-clears every controller; each controller
    /// votes (`StopDone` removes it); no continue vote means stop; a live
    /// user-visible hit breakpoint means stop; a non-debug exception
    /// means stop. A stop notifies thread observers with the filtered
    /// hit list, anything else resumes transparently.
    pub(crate) fn on_exception(&self, exception: ExceptionType, hits: &[Weak<Breakpoint>]) {
        if self.stack.borrow().is_empty() && !self.controllers.borrow().is_empty() {
            // the thread may have died mid-flight; controllers cannot
            // reason about a vanished stack
            log::debug!(target: "thread", "thread {}: empty stack, clearing controllers", self.koid);
            self.controllers.borrow_mut().clear();
        }

        let live: SmallVec<[Rc<Breakpoint>; 4]> =
            hits.iter().filter_map(Weak::upgrade).collect();

        let mut should_stop = false;
        let mut have_continue = false;
        let mut remaining: Vec<Box<dyn ThreadController>> = Vec::new();
        for mut controller in mem::take(&mut *self.controllers.borrow_mut()) {
            match controller.on_thread_stop(exception, &live) {
                StopOp::Continue => {
                    have_continue = true;
                    remaining.push(controller);
                }
                StopOp::StopDone => {
                    log::debug!(
                        target: "thread",
                        "thread {}: controller `{}` done",
                        self.koid,
                        controller.name()
                    );
                    should_stop = true;
                }
                StopOp::Unexpected => remaining.push(controller),
            }
        }
        {
            // controllers installed during the vote go after the survivors
            let mut controllers = self.controllers.borrow_mut();
            remaining.append(&mut controllers);
            *controllers = remaining;
        }

        // nobody asked to continue (including the zero-controller case)
        if !have_continue {
            should_stop = true;
        }

        // internal breakpoints and dead references never reach observers;
        // any surviving user breakpoint always stops
        let visible: SmallVec<[Rc<Breakpoint>; 4]> =
            live.into_iter().filter(|b| !b.is_internal()).collect();
        if !visible.is_empty() {
            should_stop = true;
        }

        // faults stop regardless of controller votes
        if !exception.is_debug() {
            should_stop = true;
        }

        if should_stop {
            self.state.set(ThreadState::Blocked);
            if let Some(me) = self.me.upgrade() {
                self.link
                    .observers()
                    .notify_thread(|o| o.on_thread_stopped(&me, exception, &visible));
            }
        } else {
            self.continue_(false);
        }
    }

    /// Resume the thread. With controllers installed, only the topmost
    /// one supplies the resume mode; computing the intersection of every
    /// active controller's desired range is not attempted.
    pub fn continue_(&self, forward_exception: bool) {
        let op = self.controllers.borrow().last().map(|c| c.continue_op());
        match op {
            None => {
                let how = if forward_exception {
                    ResumeHow::ForwardAndContinue
                } else {
                    ResumeHow::ResolveAndContinue
                };
                self.send_resume(how, 0, 0);
            }
            Some(ContinueOp::Default) => self.send_resume(ResumeHow::ResolveAndContinue, 0, 0),
            Some(ContinueOp::StepInstruction) => self.send_resume(ResumeHow::StepInstruction, 0, 0),
            Some(ContinueOp::StepInRange(range)) => {
                self.send_resume(ResumeHow::StepInRange, range.start, range.end)
            }
            Some(ContinueOp::SyntheticStop) => {
                // conclude locally: re-dispatch a synthetic stop with no
                // agent round trip; the cached stack stays valid
                let me = self.me.clone();
                self.link.queue().post(move || {
                    if let Some(thread) = me.upgrade() {
                        thread.on_exception(ExceptionType::Synthetic, &[]);
                    }
                });
            }
        }
    }

    /// Resume without consulting controllers or observers; used when the
    /// session suppresses an off-cycle conditional breakpoint hit.
    pub(crate) fn resume_quiet(&self) {
        self.send_resume(ResumeHow::ResolveAndContinue, 0, 0);
    }

    pub fn pause(&self, cb: Callback<()>) {
        let me = self.me.clone();
        self.link.remote().pause(
            PauseRequest {
                process_id: self.process_koid,
                thread_id: self.koid,
            },
            Box::new(move |result| match result {
                Ok(_) => {
                    if let Some(thread) = me.upgrade() {
                        thread.state.set(ThreadState::Suspended);
                        cb(Ok(()))
                    } else {
                        cb(Err(crate::session::error::Error::ObjectGone("thread")))
                    }
                }
                Err(e) => cb(Err(e)),
            }),
        );
    }

    fn send_resume(&self, how: ResumeHow, range_begin: u64, range_end: u64) {
        self.clear_frames();
        self.state.set(ThreadState::Running);
        self.link.remote().resume(
            ResumeRequest {
                process_id: self.process_koid,
                thread_ids: vec![self.koid],
                how,
                range_begin,
                range_end,
            },
            Box::new(move |result| {
                weak_error!(result, "resume failed:");
            }),
        );
    }
}
