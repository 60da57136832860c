//! Syscall interception front end: plants entry/exit breakpoints on the
//! processes matching the given filters and prints decoded invocations.

use anyhow::bail;
use clap::Parser;
use regex::Regex;
use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use tether::cfg::Config;
use tether::session::observer::SessionObserver;
use tether::session::Session;
use tether::trace::dispatcher::LogSink;
use tether::trace::{InterceptionWorkflow, WorkflowOptions};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Debug agent address, host:port.
    #[arg(long, env = "TETHER_AGENT")]
    connect: Option<String>,

    /// Main process name patterns; interception starts when one of
    /// these processes comes up and stops when the last one is gone.
    #[arg(required = true)]
    processes: Vec<String>,

    /// Additional processes to intercept once a main process runs.
    #[arg(long)]
    secondary: Vec<String>,

    /// Only intercept syscalls whose name matches this regex.
    #[arg(long)]
    syscalls: Option<String>,

    /// Use one-shot, thread-scoped exit breakpoints.
    #[arg(long)]
    one_shot: bool,

    /// Config file path.
    #[arg(long)]
    config: Option<PathBuf>,
}

struct DisconnectWatch {
    done: Rc<Cell<bool>>,
}

impl SessionObserver for DisconnectWatch {
    fn on_disconnected(&self) {
        self.done.set(true);
    }

    fn on_session_error(&self, err: &tether::session::error::Error) {
        eprintln!("session error: {err}");
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = Config::load(args.config.as_deref());

    let syscall_filter = match &args.syscalls {
        Some(raw) => Some(Regex::new(raw)?),
        None => None,
    };

    let session = Session::new();
    let workflow = InterceptionWorkflow::new(
        session.clone(),
        Rc::new(LogSink),
        WorkflowOptions {
            one_shot_exits: args.one_shot,
            syscall_filter,
        },
    );
    for pattern in &args.processes {
        workflow.add_main_filter(pattern);
    }
    for pattern in &args.secondary {
        workflow.add_secondary_filter(pattern);
    }

    let done = Rc::new(Cell::new(false));
    session
        .observers()
        .add_session(Rc::new(DisconnectWatch { done: done.clone() }));

    let Some(addr) = args.connect.clone().or(config.agent.addr.clone()) else {
        bail!("no agent address: pass --connect or set agent.addr in the config");
    };
    let connected = Rc::new(Cell::new(false));
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

    // a root job attachment carries the filters to the agent
    let job = session.system().create_new_job_context();
    job.attach(
        0,
        Box::new(|r| {
            if let Err(e) = r {
                eprintln!("job attach failed: {e}");
            }
        }),
    );

    while !done.get() {
        session.poll_wire(Duration::from_millis(100));
    }

    let decoded = workflow.dispatcher().syscalls_decoded();
    println!("{decoded} syscall invocations decoded");
    Ok(())
}
