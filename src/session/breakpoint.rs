//! One logical breakpoint: user-visible or internal scaffolding.
//!
//! The object resolves its symbolic locations per matching process and
//! keeps the agent in sync. Syncing is idempotent: module loads fire
//! often and must not spam the agent, so a message goes out only when
//! the effective wire state actually changed.

use crate::protocol::{
    status, AddOrChangeBreakpointRequest, AgentBreakpoint, BreakpointLocation, BreakpointStats,
    BreakpointType, Koid, RemoveBreakpointRequest, StopMode,
};
use crate::session::error::Error;
use crate::session::process::Process;
use crate::session::symbols::{InputLocation, ResolvedLocation};
use crate::session::target::Target;
use crate::session::thread::Thread;
use crate::session::SessionLink;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

/// Which executions a breakpoint applies to.
#[derive(Clone, Default)]
pub enum BreakpointScope {
    /// Every process of every target.
    #[default]
    Global,
    /// One target's process (whatever runs in that slot).
    Target(Weak<Target>),
    /// One concrete thread.
    Thread(Weak<Thread>),
}

#[derive(Clone)]
pub struct BreakpointSettings {
    pub enabled: bool,
    pub r#type: BreakpointType,
    pub scope: BreakpointScope,
    pub locations: Vec<InputLocation>,
    pub stop_mode: StopMode,
    pub one_shot: bool,
    /// Surface only every Nth hit as a real stop; 1 = unconditional.
    /// The gating itself lives in the session's exception pre-filter.
    pub hit_mult: u32,
}

impl Default for BreakpointSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            r#type: BreakpointType::Software,
            scope: BreakpointScope::Global,
            locations: Vec::new(),
            stop_mode: StopMode::All,
            one_shot: false,
            hit_mult: 1,
        }
    }
}

/// Resolution state for one process the breakpoint could apply to. The
/// record exists even while `resolved` is empty: a process is tracked as
/// soon as it could conceivably match, so a later module load can fill
/// the addresses in.
#[derive(Default)]
struct ProcessRecord {
    resolved: Vec<ResolvedLocation>,
}

pub struct Breakpoint {
    me: Weak<Breakpoint>,
    link: Rc<SessionLink>,
    system: Weak<crate::session::system::System>,
    /// Stable id used by the agent across add/remove/hit messages.
    id: u32,
    /// Internal breakpoints (step scaffolding, instrumentation) never
    /// appear in user-facing listings or stop observer hit lists.
    is_internal: bool,
    settings: RefCell<BreakpointSettings>,
    procs: RefCell<BTreeMap<Koid, ProcessRecord>>,
    backend_installed: Cell<bool>,
    /// Wire state of the last add-or-change, for idempotent sync.
    last_synced: RefCell<Option<AgentBreakpoint>>,
    hit_count: Cell<u32>,
}

impl Breakpoint {
    pub(crate) fn new(
        link: Rc<SessionLink>,
        system: Weak<crate::session::system::System>,
        id: u32,
        is_internal: bool,
    ) -> Rc<Breakpoint> {
        Rc::new_cyclic(|me| Breakpoint {
            me: me.clone(),
            link,
            system,
            id,
            is_internal,
            settings: RefCell::new(BreakpointSettings::default()),
            procs: RefCell::default(),
            backend_installed: Cell::new(false),
            last_synced: RefCell::new(None),
            hit_count: Cell::new(0),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_internal(&self) -> bool {
        self.is_internal
    }

    pub fn hit_count(&self) -> u32 {
        self.hit_count.get()
    }

    pub fn is_conditional(&self) -> bool {
        self.settings.borrow().hit_mult > 1
    }

    /// True when the current hit count is not on the hit-mult cycle, i.e.
    /// the hit must be suppressed rather than surfaced.
    pub fn off_cycle(&self) -> bool {
        let mult = self.settings.borrow().hit_mult;
        mult > 1 && self.hit_count.get() % mult != 0
    }

    pub fn settings(&self) -> BreakpointSettings {
        self.settings.borrow().clone()
    }

    /// Replace the settings, rebuild the per-process records against the
    /// new scope and sync the agent. Processes that stopped matching are
    /// dropped, newly matching ones get a record and a resolution pass.
    pub fn set_settings(&self, settings: BreakpointSettings) {
        *self.settings.borrow_mut() = settings;
        if let Some(system) = self.system.upgrade() {
            let live = system.all_processes();
            self.procs
                .borrow_mut()
                .retain(|koid, _| live.iter().any(|p| p.koid() == *koid));
            for process in &live {
                if self.applies_to(process) {
                    self.resolve_for(process);
                } else {
                    self.procs.borrow_mut().remove(&process.koid());
                }
            }
        }
        self.sync_backend();
        self.notify_matched(true);
    }

    // ------------------------------ lifecycle hooks (driven by System) ------------------------

    /// A process this breakpoint could apply to came alive.
    pub(crate) fn process_created(&self, process: &Rc<Process>) {
        if !self.applies_to(process) {
            return;
        }
        // track immediately, resolution may only succeed after module load
        self.procs.borrow_mut().entry(process.koid()).or_default();
        self.resolve_for(process);
        self.sync_backend();
    }

    pub(crate) fn process_destroyed(&self, koid: Koid) {
        if self.procs.borrow_mut().remove(&koid).is_some() {
            self.sync_backend();
        }
    }

    /// Module symbols of a tracked process changed, re-run resolution.
    pub(crate) fn modules_changed(&self, process: &Rc<Process>) {
        if !self.procs.borrow().contains_key(&process.koid()) {
            return;
        }
        let had = self.has_enabled_location();
        self.resolve_for(process);
        self.sync_backend();
        if !had && self.has_enabled_location() {
            self.notify_matched(false);
        }
    }

    /// The agent removed this breakpoint on its own (a one-shot fired).
    /// Only local bookkeeping: tearing down afterwards must not send a
    /// redundant remove.
    pub fn backend_breakpoint_removed(&self) {
        self.backend_installed.set(false);
        *self.last_synced.borrow_mut() = None;
    }

    pub(crate) fn update_stats(&self, stats: &BreakpointStats) {
        debug_assert_eq!(stats.id, self.id);
        self.hit_count.set(stats.hit_count);
    }

    // ------------------------------ backend sync ----------------------------------------------

    /// True if the breakpoint is enabled and resolved somewhere.
    pub fn has_enabled_location(&self) -> bool {
        self.settings.borrow().enabled
            && self.procs.borrow().values().any(|r| !r.resolved.is_empty())
    }

    /// Bring the agent to the desired state. No message is sent when the
    /// agent already matches.
    pub fn sync_backend(&self) {
        let desired = self.has_enabled_location();
        let installed = self.backend_installed.get();

        if desired {
            let wire = self.build_wire();
            if installed && self.last_synced.borrow().as_ref() == Some(&wire) {
                return;
            }
            // record the new state up front: a second sync in the same
            // turn must see the registration already in flight
            self.backend_installed.set(true);
            *self.last_synced.borrow_mut() = Some(wire.clone());
            log::debug!(target: "breakpoint", "installing breakpoint {} ({} locations)", self.id, wire.locations.len());

            let me = self.me.clone();
            self.link.remote().add_or_change_breakpoint(
                AddOrChangeBreakpointRequest { breakpoint: wire },
                Box::new(move |result| {
                    let Some(bp) = me.upgrade() else { return };
                    match result {
                        Ok(reply) if reply.status == status::OK => {}
                        Ok(reply) => bp.on_update_failure(Error::Backend(format!(
                            "breakpoint {} rejected, status={}",
                            bp.id, reply.status
                        ))),
                        Err(e) => bp.on_update_failure(e),
                    }
                }),
            );
        } else if installed {
            self.backend_installed.set(false);
            *self.last_synced.borrow_mut() = None;
            log::debug!(target: "breakpoint", "removing breakpoint {}", self.id);

            let me = self.me.clone();
            self.link.remote().remove_breakpoint(
                RemoveBreakpointRequest {
                    breakpoint_id: self.id,
                },
                Box::new(move |result| {
                    let Some(bp) = me.upgrade() else { return };
                    if let Err(e) = result {
                        bp.on_update_failure(e);
                    }
                }),
            );
        }
    }

    pub(crate) fn applies_to(&self, process: &Rc<Process>) -> bool {
        match &self.settings.borrow().scope {
            BreakpointScope::Global => true,
            BreakpointScope::Target(target) => target
                .upgrade()
                .and_then(|t| t.process())
                .is_some_and(|p| Rc::ptr_eq(&p, process)),
            BreakpointScope::Thread(thread) => thread
                .upgrade()
                .is_some_and(|t| t.process_koid() == process.koid()),
        }
    }

    fn resolve_for(&self, process: &Rc<Process>) {
        let resolved: Vec<ResolvedLocation> = self
            .settings
            .borrow()
            .locations
            .iter()
            .flat_map(|loc| process.symbols().resolve_input_location(loc))
            .collect();
        self.procs
            .borrow_mut()
            .insert(process.koid(), ProcessRecord { resolved });
    }

    fn build_wire(&self) -> AgentBreakpoint {
        let settings = self.settings.borrow();
        let thread_id = match &settings.scope {
            BreakpointScope::Thread(thread) => {
                thread.upgrade().map(|t| t.koid()).unwrap_or_default()
            }
            _ => 0,
        };
        let mut locations = Vec::new();
        for (koid, record) in self.procs.borrow().iter() {
            for loc in &record.resolved {
                locations.push(BreakpointLocation {
                    process_id: *koid,
                    thread_id,
                    address: loc.address,
                });
            }
        }
        AgentBreakpoint {
            id: self.id,
            one_shot: settings.one_shot,
            r#type: settings.r#type,
            stop: settings.stop_mode,
            locations,
        }
    }

    fn notify_matched(&self, user_requested: bool) {
        if self.is_internal || !self.has_enabled_location() {
            return;
        }
        if let Some(me) = self.me.upgrade() {
            self.link
                .observers()
                .notify_breakpoint(|o| o.on_breakpoint_matched(&me, user_requested));
        }
    }

    fn on_update_failure(&self, err: Error) {
        log::warn!(target: "breakpoint", "breakpoint {} update failed: {err:#}", self.id);
        if let Some(me) = self.me.upgrade() {
            self.link
                .observers()
                .notify_breakpoint(|o| o.on_breakpoint_update_failure(&me, &err));
        }
    }
}
