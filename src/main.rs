use anyhow::bail;
use clap::Parser;
use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use tether::cfg::Config;
use tether::protocol::{ExceptionType, Koid};
use tether::session::breakpoint::{Breakpoint, BreakpointSettings};
use tether::session::observer::{ProcessObserver, SessionObserver, ThreadObserver};
use tether::session::process::Process;
use tether::session::symbols::{DirectorySymbolServer, InputLocation};
use tether::session::thread::Thread;
use tether::session::Session;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Debug agent address, host:port.
    #[arg(long, env = "TETHER_AGENT")]
    connect: Option<String>,

    /// Attach to a process by koid.
    #[arg(long)]
    attach: Option<Koid>,

    /// Open a post-mortem snapshot instead of connecting.
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Breakpoint locations: an address (0x...), file:line, or symbol.
    #[arg(long = "break", short = 'b')]
    breakpoints: Vec<String>,

    /// Config file path.
    #[arg(long)]
    config: Option<PathBuf>,
}

struct ConsoleObserver {
    exited: Rc<Cell<bool>>,
}

impl SessionObserver for ConsoleObserver {
    fn on_connected(&self) {
        println!("connected");
    }

    fn on_disconnected(&self) {
        println!("disconnected");
        self.exited.set(true);
    }

    fn on_session_error(&self, err: &tether::session::error::Error) {
        eprintln!("session error: {err}");
    }

    fn on_previously_attached(&self, processes: &[tether::protocol::ProcessDescription]) {
        for p in processes {
            println!("agent already attached: {} ({})", p.name, p.process_id);
        }
    }

    fn on_process_in_limbo(&self, process: &tether::protocol::ProcessDescription) {
        println!("process in limbo: {} ({})", process.name, process.process_id);
    }
}

impl ProcessObserver for ConsoleObserver {
    fn on_process_created(&self, process: &Rc<Process>) {
        println!("attached to {} ({})", process.name(), process.koid());
    }

    fn on_will_destroy_process(&self, process: &Rc<Process>) {
        println!("process {} ({}) gone", process.name(), process.koid());
        self.exited.set(true);
    }
}

impl ThreadObserver for ConsoleObserver {
    fn on_thread_stopped(
        &self,
        thread: &Rc<Thread>,
        exception: ExceptionType,
        hits: &[Rc<Breakpoint>],
    ) {
        let at = thread
            .top_ip()
            .map(|ip| format!("{ip:#x}"))
            .unwrap_or_else(|| "?".to_string());
        match hits.first() {
            Some(bp) => println!(
                "thread {} stopped at {at} (breakpoint {})",
                thread.koid(),
                bp.id()
            ),
            None => println!("thread {} stopped at {at} ({exception})", thread.koid()),
        }
    }
}

fn parse_location(raw: &str) -> InputLocation {
    if let Some(hex) = raw.strip_prefix("0x") {
        if let Ok(address) = u64::from_str_radix(hex, 16) {
            return InputLocation::Address(address);
        }
    }
    if let Some((file, line)) = raw.rsplit_once(':') {
        if let Ok(line) = line.parse() {
            return InputLocation::Line {
                file: file.to_string(),
                line,
            };
        }
    }
    InputLocation::Symbol(raw.to_string())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = Config::load(args.config.as_deref());

    let session = Session::new();
    session
        .system()
        .settings()
        .pause_on_launch
        .set(config.behavior.pause_on_launch);

    for dir in &config.symbols.servers {
        session
            .system()
            .add_symbol_server(DirectorySymbolServer::new(session.queue().clone(), dir.clone()));
    }
    for (build_id, path) in &config.symbols.tables {
        if let Err(e) = session.system().symbol_catalog().register_from_file(build_id, path) {
            log::warn!("symbol table {}: {e}", path.display());
        }
    }

    let exited = Rc::new(Cell::new(false));
    let observer = Rc::new(ConsoleObserver {
        exited: exited.clone(),
    });
    session.observers().add_session(observer.clone());
    session.observers().add_process(observer.clone());
    session.observers().add_thread(observer);

    let connected = Rc::new(Cell::new(false));
    if let Some(snapshot) = &args.snapshot {
        let flag = connected.clone();
        session.open_snapshot(
            snapshot,
            Box::new(move |r| {
                r.expect("open snapshot failed");
                flag.set(true);
            }),
        );
        session.queue().drain();
    } else {
        let Some(addr) = args.connect.clone().or(config.agent.addr.clone()) else {
            bail!("no agent address: pass --connect or set agent.addr in the config");
        };
        let flag = connected.clone();
        session.connect(
            addr,
            Box::new(move |r| {
                r.expect("connect failed");
                flag.set(true);
            }),
        );
        while !connected.get() {
            session.poll_wire(Duration::from_millis(100));
        }
    }

    for raw in &args.breakpoints {
        let bp = session.system().create_new_breakpoint();
        let settings = BreakpointSettings {
            locations: vec![parse_location(raw)],
            ..bp.settings()
        };
        bp.set_settings(settings);
        println!("breakpoint {} at {raw}", bp.id());
    }

    if let Some(koid) = args.attach {
        session.system().attach_to_process(
            koid,
            Box::new(move |r| match r {
                Ok(_) => {}
                Err(e) => eprintln!("attach to {koid} failed: {e}"),
            }),
        );
    }

    while !exited.get() {
        session.poll_wire(Duration::from_millis(100));
    }

    if config.behavior.quit_agent_on_exit {
        session.quit_agent(Box::new(|_| {}));
        session.queue().drain();
    }
    Ok(())
}
