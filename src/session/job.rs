//! Job context: one job-attachment slot, owner of the filter pattern set
//! synced to the agent for that job.

use crate::protocol::{
    status, AttachKind, AttachRequest, DetachRequest, Koid, UpdateFilterRequest,
};
use crate::session::error::Error;
use crate::session::filter::Filter;
use crate::session::remote::Callback;
use crate::session::system::System;
use crate::session::SessionLink;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum JobState {
    None,
    Attaching,
    Attached,
}

pub struct JobContext {
    me: Weak<JobContext>,
    link: Rc<SessionLink>,
    system: Weak<System>,
    state: Cell<JobState>,
    koid: Cell<Koid>,
    name: RefCell<String>,
    /// Last filter list acknowledged by the agent for this job.
    filters: RefCell<Option<Vec<String>>>,
    /// List computed while not yet attached, sent on attach completion.
    pending_filters: RefCell<Option<Vec<String>>>,
}

impl JobContext {
    pub(crate) fn new(link: Rc<SessionLink>, system: Weak<System>) -> Rc<JobContext> {
        Rc::new_cyclic(|me| JobContext {
            me: me.clone(),
            link,
            system,
            state: Cell::new(JobState::None),
            koid: Cell::new(0),
            name: RefCell::new(String::new()),
            filters: RefCell::new(None),
            pending_filters: RefCell::new(None),
        })
    }

    pub fn state(&self) -> JobState {
        self.state.get()
    }

    pub fn koid(&self) -> Koid {
        self.koid.get()
    }

    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    /// Last filter list sent and acknowledged, for diagnostics/tests.
    pub fn synced_filters(&self) -> Option<Vec<String>> {
        self.filters.borrow().clone()
    }

    pub fn attach(&self, koid: Koid, cb: Callback<()>) {
        if self.state.get() != JobState::None {
            let queue = self.link.queue().clone();
            queue.post(move || cb(Err(Error::JobAlreadyAttached)));
            return;
        }
        self.state.set(JobState::Attaching);
        self.koid.set(koid);

        let me = self.me.clone();
        self.link.remote().attach(
            AttachRequest {
                kind: AttachKind::Job,
                koid,
            },
            Box::new(move |result| {
                let Some(job) = me.upgrade() else {
                    cb(Err(Error::ObjectGone("job")));
                    return;
                };
                match result {
                    Ok(reply) if reply.status == status::OK => {
                        job.state.set(JobState::Attached);
                        *job.name.borrow_mut() = reply.name;
                        // filters computed while attaching go out now
                        let intended = job.pending_filters.borrow_mut().take();
                        if let Some(filters) = intended {
                            job.send_and_update_filters(filters, true);
                        }
                        cb(Ok(()))
                    }
                    Ok(reply) => {
                        job.state.set(JobState::None);
                        cb(Err(Error::Backend(format!(
                            "error attaching to job, status={}",
                            reply.status
                        ))));
                    }
                    Err(e) => {
                        job.state.set(JobState::None);
                        cb(Err(e));
                    }
                }
            }),
        );
    }

    pub fn detach(&self, cb: Callback<()>) {
        if self.state.get() != JobState::Attached {
            let queue = self.link.queue().clone();
            queue.post(move || cb(Err(Error::JobNotAttached)));
            return;
        }
        let me = self.me.clone();
        self.link.remote().detach(
            DetachRequest {
                kind: AttachKind::Job,
                koid: self.koid.get(),
            },
            Box::new(move |result| {
                let Some(job) = me.upgrade() else {
                    cb(Err(Error::ObjectGone("job")));
                    return;
                };
                match result {
                    Ok(reply) if reply.status == status::OK => {
                        job.implicit_detach();
                        cb(Ok(()))
                    }
                    Ok(reply) => cb(Err(Error::Backend(format!(
                        "error detaching from job, status={}",
                        reply.status
                    )))),
                    Err(e) => cb(Err(e)),
                }
            }),
        );
    }

    /// Local bookkeeping only, nothing is sent.
    pub(crate) fn implicit_detach(&self) {
        self.state.set(JobState::None);
        *self.filters.borrow_mut() = None;
        *self.pending_filters.borrow_mut() = None;
    }

    /// Recompute the flattened pattern list from the system's filters and
    /// push it to the agent. Filters scoped to other jobs are skipped;
    /// the all-processes sentinel flattens to an empty string. While not
    /// attached the intent is cached for attach completion.
    pub(crate) fn refresh_filters(&self, filters: &[Rc<Filter>], force_send: bool) {
        let patterns: Vec<String> = filters
            .iter()
            .filter(|f| f.is_valid() && f.applies_to_job(self.koid.get()))
            .map(|f| f.wire_pattern())
            .collect();

        if self.state.get() != JobState::Attached {
            *self.pending_filters.borrow_mut() = Some(patterns);
            return;
        }
        self.send_and_update_filters(patterns, force_send);
    }

    /// Push one filter list. Skipped when identical to the last
    /// acknowledged list unless forced. On success the list is stored and
    /// any reported matches fan out to the system.
    fn send_and_update_filters(&self, filters: Vec<String>, force_send: bool) {
        if !force_send && self.filters.borrow().as_ref() == Some(&filters) {
            return;
        }
        log::debug!(
            target: "job",
            "job {}: syncing {} filter pattern(s)",
            self.koid.get(),
            filters.len()
        );

        let me = self.me.clone();
        let sent = filters.clone();
        self.link.remote().update_filter(
            UpdateFilterRequest {
                job_id: self.koid.get(),
                filters,
            },
            Box::new(move |result| {
                let Some(job) = me.upgrade() else { return };
                match result {
                    Ok(reply) if reply.status == status::OK => {
                        *job.filters.borrow_mut() = Some(sent);
                        if !reply.matched_processes.is_empty() {
                            if let Some(system) = job.system.upgrade() {
                                let me = job.me.upgrade().expect("job alive");
                                system.on_filter_matches(Some(&me), &reply.matched_processes);
                            }
                        }
                    }
                    Ok(reply) => {
                        log::warn!(
                            target: "job",
                            "job {}: filter update rejected, status={}",
                            job.koid.get(),
                            reply.status
                        );
                    }
                    Err(e) => {
                        log::warn!(target: "job", "job {}: filter update failed: {e:#}", job.koid.get());
                    }
                }
            }),
        );
    }
}
