//! De-duplicated, shared-ownership symbol downloads.
//!
//! One [`Download`] exists per (build id, file type) while a fetch is in
//! flight; concurrent requests share it through the system's weak cache.
//! Ownership doubles as the state machine: the object stays alive while
//! any server check or transfer still references it, and the completion
//! callbacks fire exactly once, from the destructor of the last owner.

use crate::session::error::Error;
use crate::session::symbols::{DebugFileType, FetchFn, SymbolServer};
use crate::session::system::System;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::rc::{Rc, Weak};

pub type DownloadKey = (String, DebugFileType);

type DownloadCallback = Box<dyn FnOnce(Result<PathBuf, Error>)>;

struct DownloadState {
    callbacks: Vec<DownloadCallback>,
    /// Servers that answered "yes" while a transfer is already running;
    /// tried in order when the running transfer fails.
    fallback: VecDeque<FetchFn>,
    transfer_running: bool,
    result: Result<PathBuf, String>,
}

pub struct Download {
    me: Weak<Download>,
    system: Weak<System>,
    key: DownloadKey,
    state: RefCell<DownloadState>,
}

impl Download {
    pub(crate) fn new(system: Weak<System>, key: DownloadKey) -> Rc<Download> {
        Rc::new_cyclic(|me| Download {
            me: me.clone(),
            system,
            key: key.clone(),
            state: RefCell::new(DownloadState {
                callbacks: Vec::new(),
                fallback: VecDeque::new(),
                transfer_running: false,
                result: Err(format!("no symbol server has debug info for {}", key.0)),
            }),
        })
    }

    pub fn build_id(&self) -> &str {
        &self.key.0
    }

    pub fn file_type(&self) -> DebugFileType {
        self.key.1
    }

    pub(crate) fn add_callback(&self, cb: DownloadCallback) {
        self.state.borrow_mut().callbacks.push(cb);
    }

    /// Ask one server whether it has the artifact. The check closure
    /// keeps the download alive until the server answers.
    pub(crate) fn add_server(&self, server: &Rc<dyn SymbolServer>) {
        let me = self.me.upgrade().expect("download alive");
        log::debug!(
            target: "download",
            "asking {} for {} ({})",
            server.name(),
            self.key.0,
            self.key.1
        );
        server.check_fetch(
            &self.key.0,
            self.key.1,
            Box::new(move |fetch| {
                if let Some(fetch) = fetch {
                    me.on_server_has_artifact(fetch);
                }
                // a "no" simply drops this owner
            }),
        );
    }

    /// First "yes" starts the transfer, later ones queue as fallbacks.
    fn on_server_has_artifact(&self, fetch: FetchFn) {
        let start = {
            let mut state = self.state.borrow_mut();
            if state.result.is_ok() {
                return; // already succeeded, drop the extra offer
            }
            if state.transfer_running {
                state.fallback.push_back(fetch);
                None
            } else {
                state.transfer_running = true;
                Some(fetch)
            }
        };
        if let Some(fetch) = start {
            self.run_transfer(fetch);
        }
    }

    fn run_transfer(&self, fetch: FetchFn) {
        let me = self.me.upgrade().expect("download alive");
        fetch(Box::new(move |result| match result {
            Ok(path) => {
                log::debug!(target: "download", "{} fetched to {}", me.key.0, path.display());
                me.state.borrow_mut().result = Ok(path);
            }
            Err(msg) => {
                log::debug!(target: "download", "{} transfer failed: {msg}", me.key.0);
                let next = {
                    let mut state = me.state.borrow_mut();
                    state.result = Err(msg);
                    match state.fallback.pop_front() {
                        Some(next) => Some(next),
                        None => {
                            state.transfer_running = false;
                            None
                        }
                    }
                };
                if let Some(next) = next {
                    me.run_transfer(next);
                }
            }
        }));
    }
}

impl Drop for Download {
    /// All owners are gone: the transfer pipeline drained (success,
    /// exhausted fallbacks, or cancellation by drop). Completion fires
    /// here, exactly once, for every registered caller.
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        let result = std::mem::replace(&mut state.result, Err(String::new()));
        let callbacks = std::mem::take(&mut state.callbacks);
        drop(state);

        let success = result.is_ok();
        for cb in callbacks {
            match &result {
                Ok(path) => cb(Ok(path.clone())),
                Err(msg) => cb(Err(Error::DownloadFailed(msg.clone()))),
            }
        }
        if let Some(system) = self.system.upgrade() {
            system.on_download_finished(&self.key, success);
        }
    }
}
