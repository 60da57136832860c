//! Process filters: patterns the agent matches against newly launched
//! processes to drive client auto-attach.

use crate::protocol::Koid;
use crate::session::system::System;
use crate::session::SessionLink;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use strum_macros::Display;

/// Pattern that matches every process. Flattened to an empty string on
/// the wire, see [`crate::session::job::JobContext`].
pub const ALL_PROCESSES_PATTERN: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FilterType {
    /// No type chosen yet; such a filter is never synced.
    Unset,
    /// Substring of the process name.
    ProcessNameSubstr,
    /// Exact process name.
    ProcessName,
    /// Component name.
    Component,
    /// Full component URL.
    ComponentUrl,
    /// Component moniker.
    ComponentMoniker,
}

pub struct Filter {
    me: Weak<Filter>,
    link: Rc<SessionLink>,
    system: Weak<System>,
    r#type: Cell<FilterType>,
    pattern: RefCell<String>,
    /// `None` applies the filter to every attached job.
    job_id: Cell<Option<Koid>>,
}

impl Filter {
    pub(crate) fn new(link: Rc<SessionLink>, system: Weak<System>) -> Rc<Filter> {
        Rc::new_cyclic(|me| Filter {
            me: me.clone(),
            link,
            system,
            r#type: Cell::new(FilterType::Unset),
            pattern: RefCell::new(String::new()),
            job_id: Cell::new(None),
        })
    }

    pub fn filter_type(&self) -> FilterType {
        self.r#type.get()
    }

    pub fn set_type(&self, r#type: FilterType) {
        self.r#type.set(r#type);
        self.sync();
    }

    pub fn pattern(&self) -> String {
        self.pattern.borrow().clone()
    }

    pub fn set_pattern(&self, pattern: impl Into<String>) {
        *self.pattern.borrow_mut() = pattern.into();
        self.sync();
    }

    pub fn job_id(&self) -> Option<Koid> {
        self.job_id.get()
    }

    pub fn set_job_id(&self, job: Option<Koid>) {
        self.job_id.set(job);
        self.sync();
    }

    /// A filter participates in syncing only when a type is chosen and it
    /// is either job-scoped or carries a pattern.
    pub fn is_valid(&self) -> bool {
        self.r#type.get() != FilterType::Unset
            && (self.job_id.get().is_some() || !self.pattern.borrow().is_empty())
    }

    /// The pattern as sent to the agent: the all-processes sentinel maps
    /// to an empty string by wire convention.
    pub fn wire_pattern(&self) -> String {
        let pattern = self.pattern.borrow();
        if *pattern == ALL_PROCESSES_PATTERN {
            String::new()
        } else {
            pattern.clone()
        }
    }

    /// Applicability to one job (`None` scope means every job).
    pub fn applies_to_job(&self, job: Koid) -> bool {
        match self.job_id.get() {
            None => true,
            Some(scoped) => scoped == job,
        }
    }

    /// Every mutation funnels here: observers hear about the change and
    /// the system schedules one coalesced filter sync.
    fn sync(&self) {
        if let Some(me) = self.me.upgrade() {
            self.link.observers().notify_filter(|o| o.on_filter_changed(&me));
        }
        if let Some(system) = self.system.upgrade() {
            system.sync_filters();
        }
    }
}
