//! Target: one process-attachment slot.
//!
//! The slot cycles `None -> Attaching|Starting -> Running -> None`; there
//! is exactly one [`Process`] while Running. Precondition failures are
//! reported through the posted path, never reentrantly.

use crate::protocol::{
    status, AttachKind, AttachRequest, DetachRequest, KillRequest, Koid, LaunchRequest,
    ProcessStatusRequest,
};
use crate::session::error::Error;
use crate::session::process::Process;
use crate::session::remote::Callback;
use crate::session::system::System;
use crate::session::SessionLink;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TargetState {
    /// Empty slot.
    None,
    /// Attach request in flight.
    Attaching,
    /// Launch request in flight.
    Starting,
    /// Holding a live process.
    Running,
}

pub struct Target {
    me: Weak<Target>,
    link: Rc<SessionLink>,
    system: Weak<System>,
    state: Cell<TargetState>,
    process: RefCell<Option<Rc<Process>>>,
}

impl Target {
    pub(crate) fn new(link: Rc<SessionLink>, system: Weak<System>) -> Rc<Target> {
        Rc::new_cyclic(|me| Target {
            me: me.clone(),
            link,
            system,
            state: Cell::new(TargetState::None),
            process: RefCell::new(None),
        })
    }

    pub fn state(&self) -> TargetState {
        self.state.get()
    }

    pub fn process(&self) -> Option<Rc<Process>> {
        self.process.borrow().clone()
    }

    pub(crate) fn system(&self) -> Option<Rc<System>> {
        self.system.upgrade()
    }

    /// Koid of the running process, if any.
    pub fn process_koid(&self) -> Option<Koid> {
        self.process.borrow().as_ref().map(|p| p.koid())
    }

    /// Free for reuse by filter-driven attach.
    pub(crate) fn is_idle(&self) -> bool {
        self.state.get() == TargetState::None
    }

    // ------------------------------ operations ------------------------------------------------

    pub fn launch(&self, argv: Vec<String>, cb: Callback<Rc<Process>>) {
        if self.state.get() != TargetState::None {
            self.post_err(cb, Error::TargetAlreadyRunning);
            return;
        }
        self.state.set(TargetState::Starting);

        let me = self.me.clone();
        self.link.remote().launch(
            LaunchRequest { argv },
            Box::new(move |result| {
                let Some(target) = me.upgrade() else {
                    cb(Err(Error::ObjectGone("target")));
                    return;
                };
                match result {
                    Ok(reply) if reply.status == status::OK => {
                        let process =
                            target.create_process(reply.process_id, reply.process_name);
                        cb(Ok(process));
                    }
                    Ok(reply) if reply.status == status::ERR_IO => {
                        target.state.set(TargetState::None);
                        cb(Err(Error::BinaryNotFound));
                    }
                    Ok(reply) => {
                        target.state.set(TargetState::None);
                        cb(Err(Error::Backend(format!(
                            "error launching, status={}",
                            reply.status
                        ))));
                    }
                    Err(e) => {
                        target.state.set(TargetState::None);
                        cb(Err(e));
                    }
                }
            }),
        );
    }

    pub fn attach(&self, koid: Koid, cb: Callback<Rc<Process>>) {
        if self.state.get() != TargetState::None {
            self.post_err(cb, Error::TargetAlreadyRunning);
            return;
        }
        self.state.set(TargetState::Attaching);

        let me = self.me.clone();
        self.link.remote().attach(
            AttachRequest {
                kind: AttachKind::Process,
                koid,
            },
            Box::new(move |result| {
                let Some(target) = me.upgrade() else {
                    cb(Err(Error::ObjectGone("target")));
                    return;
                };
                match result {
                    Ok(reply) if reply.status == status::OK => {
                        let process = target.create_process(koid, reply.name);
                        cb(Ok(process));
                    }
                    Ok(reply) if reply.status == status::ERR_ALREADY_BOUND => {
                        // could be a benign race with the agent's own
                        // filter attach, ask about the process to decide
                        target.probe_already_bound(koid, cb);
                    }
                    Ok(reply) => {
                        target.state.set(TargetState::None);
                        cb(Err(Error::Backend(format!(
                            "error attaching, status={}",
                            reply.status
                        ))));
                    }
                    Err(e) => {
                        target.state.set(TargetState::None);
                        cb(Err(e));
                    }
                }
            }),
        );
    }

    /// Secondary probe after an already-bound attach reply: if the agent
    /// reports the process as attached and healthy this was a benign
    /// re-attach race, otherwise a genuine conflict.
    fn probe_already_bound(&self, koid: Koid, cb: Callback<Rc<Process>>) {
        let me = self.me.clone();
        self.link.remote().process_status(
            ProcessStatusRequest { process_id: koid },
            Box::new(move |result| {
                let Some(target) = me.upgrade() else {
                    cb(Err(Error::ObjectGone("target")));
                    return;
                };
                match result {
                    Ok(reply) if reply.status == status::OK => {
                        log::debug!(target: "target", "attach to {koid} raced with the agent, treating as success");
                        let process = target.create_process(koid, reply.record.name);
                        cb(Ok(process));
                    }
                    _ => {
                        target.state.set(TargetState::None);
                        cb(Err(Error::AlreadyAttached(koid)));
                    }
                }
            }),
        );
    }

    pub fn kill(&self, cb: Callback<()>) {
        let Some(koid) = self.process_koid() else {
            self.post_err(cb, Error::NoRunningProcess);
            return;
        };
        let me = self.me.clone();
        self.link.remote().kill(
            KillRequest { process_id: koid },
            Box::new(move |result| {
                let Some(target) = me.upgrade() else {
                    cb(Err(Error::ObjectGone("target")));
                    return;
                };
                match result {
                    Ok(reply) if reply.status == status::OK => {
                        target.destroy_process();
                        cb(Ok(()))
                    }
                    Ok(reply) => cb(Err(Error::Backend(format!(
                        "error killing, status={}",
                        reply.status
                    )))),
                    Err(e) => cb(Err(e)),
                }
            }),
        );
    }

    pub fn detach(&self, cb: Callback<()>) {
        let Some(koid) = self.process_koid() else {
            self.post_err(cb, Error::NoRunningProcess);
            return;
        };
        let me = self.me.clone();
        self.link.remote().detach(
            DetachRequest {
                kind: AttachKind::Process,
                koid,
            },
            Box::new(move |result| {
                let Some(target) = me.upgrade() else {
                    cb(Err(Error::ObjectGone("target")));
                    return;
                };
                match result {
                    Ok(reply) if reply.status == status::OK => {
                        target.destroy_process();
                        cb(Ok(()))
                    }
                    Ok(reply) => cb(Err(Error::Backend(format!(
                        "error detaching, status={}",
                        reply.status
                    )))),
                    Err(e) => cb(Err(e)),
                }
            }),
        );
    }

    // ------------------------------ agent-driven transitions ----------------------------------

    /// The agent attached this process on our behalf (filter match or
    /// launch notification routed to this slot).
    pub(crate) fn assign_from_agent(&self, koid: Koid, name: String) -> Rc<Process> {
        debug_assert_eq!(self.state.get(), TargetState::None);
        self.create_process(koid, name)
    }

    /// The process died on the agent side.
    pub(crate) fn on_process_exiting(&self, return_code: i32) {
        log::debug!(
            target: "target",
            "process {:?} exited with code {return_code}",
            self.process_koid()
        );
        self.destroy_process();
    }

    /// Local bookkeeping only; the connection is gone, nothing is sent.
    pub(crate) fn implicit_detach(&self) {
        if self.state.get() == TargetState::Running {
            self.destroy_process();
        } else {
            self.state.set(TargetState::None);
        }
    }

    // ------------------------------ internals -------------------------------------------------

    fn create_process(&self, koid: Koid, name: String) -> Rc<Process> {
        let me = self.me.upgrade().expect("target alive");
        let system = self.system.upgrade().expect("system outlives targets");
        let process = Process::new(self.link.clone(), &me, system.symbol_catalog(), koid, name);
        *self.process.borrow_mut() = Some(process.clone());
        self.state.set(TargetState::Running);
        self.link
            .observers()
            .notify_process(|o| o.on_process_created(&process));
        system.on_process_created(&process);
        process
    }

    /// Tear down the running process: observers see it alive during the
    /// notification, the object is released afterwards.
    fn destroy_process(&self) {
        let Some(process) = self.process.borrow_mut().take() else {
            self.state.set(TargetState::None);
            return;
        };
        self.state.set(TargetState::None);
        self.link
            .observers()
            .notify_process(|o| o.on_will_destroy_process(&process));
        if let Some(system) = self.system.upgrade() {
            system.on_process_destroyed(process.koid());
        }
        drop(process);
    }

    fn post_err<T: 'static>(&self, cb: Callback<T>, err: Error) {
        self.link.queue().post(move || cb(Err(err)));
    }
}
