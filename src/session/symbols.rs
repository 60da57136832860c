//! Boundary to the symbol subsystem.
//!
//! Symbolication proper (debug-info parsing, demangling) lives outside
//! this crate; the session consumes it through [`SymbolCatalog`] lookup
//! tables keyed by module build id. A plain address-table implementation
//! ships here so breakpoint resolution and symbol status reporting are
//! fully functional: tables are registered programmatically or loaded
//! from a json sidecar produced by the build.

use crate::protocol::Module;
use crate::session::exec::EventQueue;
use serde::Deserialize;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use strum_macros::Display;

/// A location the user asked for, before resolution against symbols.
#[derive(Debug, Clone, PartialEq)]
pub enum InputLocation {
    /// Absolute address in the process, needs no symbols.
    Address(u64),
    /// Function or marker symbol name.
    Symbol(String),
    /// Source file and line.
    Line { file: String, line: u32 },
}

/// One address an input location resolved to in a concrete process.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLocation {
    pub address: u64,
    pub symbol: Option<String>,
}

/// Module-relative symbol table for one build id.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SymbolTable {
    /// symbol name -> module-relative address
    pub functions: HashMap<String, u64>,
    /// "file:line" -> module-relative address
    #[serde(default)]
    pub lines: HashMap<String, u64>,
}

impl SymbolTable {
    pub fn with_functions<I: IntoIterator<Item = (String, u64)>>(functions: I) -> Self {
        Self {
            functions: functions.into_iter().collect(),
            lines: HashMap::new(),
        }
    }
}

/// Build-id keyed registry of symbol tables, shared by all processes of
/// one session.
#[derive(Default)]
pub struct SymbolCatalog {
    tables: RefCell<HashMap<String, Rc<SymbolTable>>>,
}

impl SymbolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, build_id: impl Into<String>, table: SymbolTable) {
        self.tables.borrow_mut().insert(build_id.into(), Rc::new(table));
    }

    /// Load a json sidecar table (the build emits one per binary).
    pub fn register_from_file(&self, build_id: impl Into<String>, path: &Path) -> std::io::Result<()> {
        let data = std::fs::read(path)?;
        let table: SymbolTable = serde_json::from_slice(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.register(build_id, table);
        Ok(())
    }

    pub fn get(&self, build_id: &str) -> Option<Rc<SymbolTable>> {
        self.tables.borrow().get(build_id).cloned()
    }
}

/// Load status of one module, as reported to status consumers.
#[derive(Debug, Clone)]
pub struct ModuleSymbolStatus {
    pub name: String,
    pub build_id: String,
    pub base: u64,
    pub symbols_loaded: bool,
}

/// Per-process symbol view: the loaded module list joined with the
/// catalog tables.
pub struct ProcessSymbols {
    catalog: Rc<SymbolCatalog>,
    modules: RefCell<Vec<Module>>,
}

impl ProcessSymbols {
    pub fn new(catalog: Rc<SymbolCatalog>) -> Self {
        Self {
            catalog,
            modules: RefCell::new(Vec::new()),
        }
    }

    pub fn update_modules(&self, modules: Vec<Module>) {
        *self.modules.borrow_mut() = modules;
    }

    pub fn modules(&self) -> Vec<Module> {
        self.modules.borrow().clone()
    }

    /// Resolve an input location against every loaded module.
    /// Address locations resolve to themselves, symbolic ones to every
    /// matching module-relative entry rebased on the module load address.
    pub fn resolve_input_location(&self, location: &InputLocation) -> Vec<ResolvedLocation> {
        match location {
            InputLocation::Address(address) => vec![ResolvedLocation {
                address: *address,
                symbol: None,
            }],
            InputLocation::Symbol(name) => self
                .each_table(|module, table| {
                    table.functions.get(name).map(|offset| ResolvedLocation {
                        address: module.base + offset,
                        symbol: Some(name.clone()),
                    })
                }),
            InputLocation::Line { file, line } => {
                let key = format!("{file}:{line}");
                self.each_table(|module, table| {
                    table.lines.get(&key).map(|offset| ResolvedLocation {
                        address: module.base + offset,
                        symbol: None,
                    })
                })
            }
        }
    }

    /// Absolute address of a named symbol, first match wins.
    pub fn symbol_address(&self, name: &str) -> Option<u64> {
        self.resolve_input_location(&InputLocation::Symbol(name.to_string()))
            .first()
            .map(|loc| loc.address)
    }

    pub fn status(&self) -> Vec<ModuleSymbolStatus> {
        self.modules
            .borrow()
            .iter()
            .map(|m| ModuleSymbolStatus {
                name: m.name.clone(),
                build_id: m.build_id.clone(),
                base: m.base,
                symbols_loaded: self.catalog.get(&m.build_id).is_some(),
            })
            .collect()
    }

    fn each_table(
        &self,
        f: impl Fn(&Module, &SymbolTable) -> Option<ResolvedLocation>,
    ) -> Vec<ResolvedLocation> {
        let mut out = Vec::new();
        for module in self.modules.borrow().iter() {
            if let Some(table) = self.catalog.get(&module.build_id) {
                if let Some(loc) = f(module, &table) {
                    out.push(loc);
                }
            }
        }
        out
    }
}

// ---------------------------------- symbol servers --------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SymbolServerState {
    Initializing,
    /// Waiting for authentication, not usable yet.
    Auth,
    Ready,
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum DebugFileType {
    DebugInfo,
    Binary,
}

/// Closure that performs one artifact fetch when invoked.
pub type FetchFn = Box<dyn FnOnce(Box<dyn FnOnce(Result<PathBuf, String>)>)>;

/// One remote (or local) store of debug artifacts, keyed by build id.
pub trait SymbolServer {
    fn name(&self) -> &str;
    fn state(&self) -> SymbolServerState;

    /// Ask whether this server can provide the artifact. The callback
    /// receives a fetch starter when it can, `None` otherwise. The reply
    /// must be asynchronous (posted), never inline.
    fn check_fetch(
        &self,
        build_id: &str,
        file_type: DebugFileType,
        cb: Box<dyn FnOnce(Option<FetchFn>)>,
    );
}

/// Directory-backed symbol server: artifacts laid out as
/// `<root>/<build_id>.debug` / `<root>/<build_id>.bin`.
pub struct DirectorySymbolServer {
    queue: EventQueue,
    root: PathBuf,
    state: Cell<SymbolServerState>,
    name: String,
}

impl DirectorySymbolServer {
    pub fn new(queue: EventQueue, root: PathBuf) -> Rc<Self> {
        let state = if root.is_dir() {
            SymbolServerState::Ready
        } else {
            SymbolServerState::Unreachable
        };
        Rc::new(Self {
            queue,
            name: format!("dir:{}", root.display()),
            root,
            state: Cell::new(state),
        })
    }
}

impl SymbolServer for DirectorySymbolServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> SymbolServerState {
        self.state.get()
    }

    fn check_fetch(
        &self,
        build_id: &str,
        file_type: DebugFileType,
        cb: Box<dyn FnOnce(Option<FetchFn>)>,
    ) {
        let ext = match file_type {
            DebugFileType::DebugInfo => "debug",
            DebugFileType::Binary => "bin",
        };
        let path = self.root.join(format!("{build_id}.{ext}"));
        let queue = self.queue.clone();
        self.queue.post(move || {
            if !path.is_file() {
                cb(None);
                return;
            }
            // a local file needs no transfer, the fetch resolves immediately
            let fetch: FetchFn = Box::new(move |done| {
                queue.post(move || done(Ok(path)));
            });
            cb(Some(fetch));
        });
    }
}
