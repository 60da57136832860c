//! System: the root registry of debugging objects. Owns targets, job
//! contexts, breakpoints, filters, symbol servers and in-flight
//! downloads, and fans lifecycle notifications out to observers.

use crate::protocol::Koid;
use crate::session::breakpoint::Breakpoint;
use crate::session::download::{Download, DownloadKey};
use crate::session::error::Error;
use crate::session::filter::Filter;
use crate::session::job::JobContext;
use crate::session::process::Process;
use crate::session::remote::Callback;
use crate::session::symbols::{DebugFileType, SymbolCatalog, SymbolServer, SymbolServerState};
use crate::session::target::Target;
use crate::session::SessionLink;
use crate::weak_error;
use indexmap::IndexMap;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::rc::{Rc, Weak};

/// Refuse to auto-attach when one filter notification matches more than
/// this many processes; a broader match is almost certainly a filter
/// misconfiguration.
pub const MAX_FILTER_MATCHES_ATTACHED: usize = 50;

/// Client-side knobs consulted by the session dispatch.
#[derive(Default)]
pub struct SystemSettings {
    /// Keep the (single) stopped thread paused after a module-load
    /// notification instead of resuming it.
    pub pause_on_launch: Cell<bool>,
    /// Send the agent a quit request when the session shuts down.
    pub quit_agent_on_exit: Cell<bool>,
}

pub struct System {
    me: Weak<System>,
    link: Rc<SessionLink>,
    targets: RefCell<Vec<Rc<Target>>>,
    jobs: RefCell<Vec<Rc<JobContext>>>,
    breakpoints: RefCell<IndexMap<u32, Rc<Breakpoint>>>,
    next_breakpoint_id: Cell<u32>,
    filters: RefCell<Vec<Rc<Filter>>>,
    symbol_servers: RefCell<Vec<Rc<dyn SymbolServer>>>,
    downloads: RefCell<HashMap<DownloadKey, Weak<Download>>>,
    active_downloads: Cell<usize>,
    download_success: Cell<usize>,
    download_fail: Cell<usize>,
    filter_sync_pending: Cell<bool>,
    settings: SystemSettings,
    catalog: Rc<SymbolCatalog>,
}

impl System {
    pub(crate) fn new(link: Rc<SessionLink>) -> Rc<System> {
        let system = Rc::new_cyclic(|me| System {
            me: me.clone(),
            link,
            targets: RefCell::default(),
            jobs: RefCell::default(),
            breakpoints: RefCell::default(),
            next_breakpoint_id: Cell::new(1),
            filters: RefCell::default(),
            symbol_servers: RefCell::default(),
            downloads: RefCell::default(),
            active_downloads: Cell::new(0),
            download_success: Cell::new(0),
            download_fail: Cell::new(0),
            filter_sync_pending: Cell::new(false),
            settings: SystemSettings::default(),
            catalog: Rc::new(SymbolCatalog::new()),
        });
        // a system always carries at least one target slot
        system.create_new_target();
        system
    }

    pub fn settings(&self) -> &SystemSettings {
        &self.settings
    }

    pub fn symbol_catalog(&self) -> Rc<SymbolCatalog> {
        self.catalog.clone()
    }

    // ------------------------------ targets ---------------------------------------------------

    pub fn targets(&self) -> Vec<Rc<Target>> {
        self.targets.borrow().clone()
    }

    pub fn create_new_target(&self) -> Rc<Target> {
        let target = Target::new(self.link.clone(), self.me.clone());
        self.targets.borrow_mut().push(target.clone());
        self.link
            .observers()
            .notify_target(|o| o.on_target_created(&target));
        target
    }

    /// The last target slot is permanent and cannot be removed.
    pub fn delete_target(&self, target: &Rc<Target>) -> Result<(), Error> {
        if self.targets.borrow().len() <= 1 {
            return Err(Error::LastTarget);
        }
        target.implicit_detach();
        self.link
            .observers()
            .notify_target(|o| o.on_will_destroy_target(target));
        self.targets.borrow_mut().retain(|t| !Rc::ptr_eq(t, target));
        Ok(())
    }

    pub fn all_processes(&self) -> Vec<Rc<Process>> {
        self.targets
            .borrow()
            .iter()
            .filter_map(|t| t.process())
            .collect()
    }

    pub fn process_by_koid(&self, koid: Koid) -> Option<Rc<Process>> {
        self.all_processes().into_iter().find(|p| p.koid() == koid)
    }

    pub fn is_process_attached(&self, koid: Koid) -> bool {
        self.process_by_koid(koid).is_some()
    }

    /// Attach to a process, reusing an idle target slot or creating one.
    /// Attaching twice to the same koid is refused up front, before any
    /// agent message goes out.
    pub fn attach_to_process(&self, koid: Koid, cb: Callback<Rc<Process>>) {
        if self.is_process_attached(koid) {
            let queue = self.link.queue().clone();
            queue.post(move || cb(Err(Error::AlreadyAttached(koid))));
            return;
        }
        self.free_target().attach(koid, cb);
    }

    /// An idle target slot, or a fresh one when all are busy.
    pub(crate) fn free_target(&self) -> Rc<Target> {
        let idle = self.targets.borrow().iter().find(|t| t.is_idle()).cloned();
        idle.unwrap_or_else(|| self.create_new_target())
    }

    // ------------------------------ jobs ------------------------------------------------------

    pub fn jobs(&self) -> Vec<Rc<JobContext>> {
        self.jobs.borrow().clone()
    }

    pub fn create_new_job_context(&self) -> Rc<JobContext> {
        let job = JobContext::new(self.link.clone(), self.me.clone());
        self.jobs.borrow_mut().push(job.clone());
        job
    }

    pub fn delete_job_context(&self, job: &Rc<JobContext>) {
        self.jobs.borrow_mut().retain(|j| !Rc::ptr_eq(j, job));
    }

    // ------------------------------ breakpoints -----------------------------------------------

    /// User-visible breakpoints only; internal scaffolding is hidden.
    pub fn breakpoints(&self) -> Vec<Rc<Breakpoint>> {
        self.breakpoints
            .borrow()
            .values()
            .filter(|b| !b.is_internal())
            .cloned()
            .collect()
    }

    pub fn breakpoint_by_id(&self, id: u32) -> Option<Rc<Breakpoint>> {
        self.breakpoints.borrow().get(&id).cloned()
    }

    pub fn create_new_breakpoint(&self) -> Rc<Breakpoint> {
        self.create_breakpoint_inner(false)
    }

    /// Internal breakpoints back step scaffolding and instrumentation;
    /// observers are not told about them and listings skip them.
    pub fn create_new_internal_breakpoint(&self) -> Rc<Breakpoint> {
        self.create_breakpoint_inner(true)
    }

    fn create_breakpoint_inner(&self, is_internal: bool) -> Rc<Breakpoint> {
        let id = self.next_breakpoint_id.get();
        self.next_breakpoint_id.set(id + 1);
        let breakpoint = Breakpoint::new(self.link.clone(), self.me.clone(), id, is_internal);
        self.breakpoints.borrow_mut().insert(id, breakpoint.clone());
        if !is_internal {
            self.link
                .observers()
                .notify_system(|o| o.on_breakpoint_created(&breakpoint));
        }
        breakpoint
    }

    /// Deleting a breakpoint that is not registered is a bug in the
    /// caller, not a user error.
    pub fn delete_breakpoint(&self, breakpoint: &Rc<Breakpoint>) {
        assert!(
            self.breakpoints.borrow().contains_key(&breakpoint.id()),
            "deleting unregistered breakpoint {}",
            breakpoint.id()
        );
        self.delete_breakpoint_quiet(breakpoint);
    }

    /// Remove if present; tolerates repeated deletion (controller drops
    /// race with session teardown). Observers hear about the deletion
    /// while the breakpoint is still registered.
    pub(crate) fn delete_breakpoint_quiet(&self, breakpoint: &Rc<Breakpoint>) {
        if !self.breakpoints.borrow().contains_key(&breakpoint.id()) {
            return;
        }
        if !breakpoint.is_internal() {
            self.link
                .observers()
                .notify_system(|o| o.on_breakpoint_will_be_deleted(breakpoint));
        }
        // an observer may have raced the deletion
        let removed = self.breakpoints.borrow_mut().shift_remove(&breakpoint.id());
        let Some(removed) = removed else { return };
        // uninstall from the agent unless the agent already dropped it
        let mut settings = removed.settings();
        settings.enabled = false;
        removed.set_settings(settings);
    }

    // ------------------------------ process lifecycle fan-out ---------------------------------

    pub(crate) fn on_process_created(&self, process: &Rc<Process>) {
        let breakpoints: Vec<_> = self.breakpoints.borrow().values().cloned().collect();
        for bp in breakpoints {
            bp.process_created(process);
        }
    }

    pub(crate) fn on_process_destroyed(&self, koid: Koid) {
        let breakpoints: Vec<_> = self.breakpoints.borrow().values().cloned().collect();
        for bp in breakpoints {
            bp.process_destroyed(koid);
        }
    }

    pub(crate) fn on_process_modules_changed(&self, process: &Rc<Process>) {
        let breakpoints: Vec<_> = self.breakpoints.borrow().values().cloned().collect();
        for bp in breakpoints {
            bp.modules_changed(process);
        }
    }

    // ------------------------------ filters ---------------------------------------------------

    pub fn filters(&self) -> Vec<Rc<Filter>> {
        self.filters.borrow().clone()
    }

    pub fn create_new_filter(&self) -> Rc<Filter> {
        let filter = Filter::new(self.link.clone(), self.me.clone());
        self.filters.borrow_mut().push(filter.clone());
        self.link
            .observers()
            .notify_filter(|o| o.on_filter_created(&filter));
        filter
    }

    pub fn delete_filter(&self, filter: &Rc<Filter>) {
        self.link
            .observers()
            .notify_filter(|o| o.on_filter_will_be_deleted(filter));
        self.filters.borrow_mut().retain(|f| !Rc::ptr_eq(f, filter));
        self.sync_filters();
    }

    /// Schedule one coalesced filter sync: any number of filter mutations
    /// inside one queue turn produce a single update per job.
    pub fn sync_filters(&self) {
        if self.filter_sync_pending.replace(true) {
            return;
        }
        let me = self.me.clone();
        self.link.queue().post(move || {
            if let Some(system) = me.upgrade() {
                system.run_filter_sync(false);
            }
        });
    }

    fn run_filter_sync(&self, force_send: bool) {
        self.filter_sync_pending.set(false);
        let filters = self.filters();
        for job in self.jobs() {
            job.refresh_filters(&filters, force_send);
        }
    }

    /// The agent reported which live processes match a job's filter set.
    /// Oversized match lists attach nothing: a filter that matches that
    /// broadly is treated as misconfigured.
    pub fn on_filter_matches(&self, job: Option<&Rc<JobContext>>, matched: &[Koid]) {
        self.link
            .observers()
            .notify_filter(|o| o.on_filter_matches(job, matched));

        if matched.len() > MAX_FILTER_MATCHES_ATTACHED {
            log::error!(
                target: "system",
                "filter matched {} processes (limit {MAX_FILTER_MATCHES_ATTACHED}), attaching to none",
                matched.len()
            );
            return;
        }

        let mut seen = HashSet::new();
        for &koid in matched {
            if !seen.insert(koid) || self.is_process_attached(koid) {
                continue;
            }
            self.free_target().attach(
                koid,
                Box::new(move |result| {
                    weak_error!(result, "filter-driven attach failed:");
                }),
            );
        }
    }

    // ------------------------------ symbol servers & downloads --------------------------------

    pub fn add_symbol_server(&self, server: Rc<dyn SymbolServer>) {
        self.symbol_servers.borrow_mut().push(server);
    }

    pub fn symbol_servers(&self) -> Vec<Rc<dyn SymbolServer>> {
        self.symbol_servers.borrow().clone()
    }

    /// The shared in-flight download for a key; concurrent callers get
    /// the same object instead of duplicate fetches.
    pub fn get_download(&self, build_id: impl Into<String>, file_type: DebugFileType) -> Rc<Download> {
        let key = (build_id.into(), file_type);
        if let Some(existing) = self.downloads.borrow().get(&key).and_then(Weak::upgrade) {
            return existing;
        }

        let download = Download::new(self.me.clone(), key.clone());
        self.downloads
            .borrow_mut()
            .insert(key, Rc::downgrade(&download));

        let was_idle = self.active_downloads.get() == 0;
        self.active_downloads.set(self.active_downloads.get() + 1);
        if was_idle {
            self.link.observers().notify_system(|o| o.on_downloads_started());
        }

        for server in self.symbol_servers() {
            if server.state() == SymbolServerState::Ready {
                download.add_server(&server);
            }
        }
        download
    }

    /// Download an artifact and get called back exactly once, when the
    /// shared transfer concludes.
    pub fn request_download(
        &self,
        build_id: impl Into<String>,
        file_type: DebugFileType,
        cb: Callback<PathBuf>,
    ) {
        let download = self.get_download(build_id, file_type);
        download.add_callback(Box::new(move |r| cb(r)));
        // the transient reference drops here; server checks and the
        // transfer keep the download alive until it concludes
    }

    /// Called from the download destructor. Aggregate started/stopped
    /// events fire only on the 0 -> 1 and 1 -> 0 edges.
    pub(crate) fn on_download_finished(&self, key: &DownloadKey, success: bool) {
        self.downloads.borrow_mut().remove(key);
        if success {
            self.download_success.set(self.download_success.get() + 1);
        } else {
            self.download_fail.set(self.download_fail.get() + 1);
        }

        let remaining = self.active_downloads.get().saturating_sub(1);
        self.active_downloads.set(remaining);
        if remaining == 0 {
            let success_count = self.download_success.take();
            let fail_count = self.download_fail.take();
            self.link
                .observers()
                .notify_system(|o| o.on_downloads_stopped(success_count, fail_count));
        }
    }

    // ------------------------------ connection transitions ------------------------------------

    /// A live agent connection came up: push the current breakpoint and
    /// filter state to it.
    pub(crate) fn did_connect(&self) {
        let breakpoints: Vec<_> = self.breakpoints.borrow().values().cloned().collect();
        for bp in breakpoints {
            bp.sync_backend();
        }
        let me = self.me.clone();
        self.link.queue().post(move || {
            if let Some(system) = me.upgrade() {
                system.run_filter_sync(true);
            }
        });
    }

    /// The connection is gone: local bookkeeping only, nothing can be
    /// sent to a dead agent.
    pub(crate) fn did_disconnect(&self) {
        for target in self.targets() {
            target.implicit_detach();
        }
        for job in self.jobs() {
            job.implicit_detach();
        }
        let breakpoints: Vec<_> = self.breakpoints.borrow().values().cloned().collect();
        for bp in breakpoints {
            bp.backend_breakpoint_removed();
        }
    }
}
