//! `ddepeer`: a DDE participant for scripting and tests.
//!
//! `serve` maps windows and answers messages until killed; the other
//! commands perform one operation against the shared main block and exit.
//! Exit codes: 0 success, 1 failure, 2 peer gone, 3 timeout.

use clap::{Parser, Subcommand};
use ddeshm::{
    Atom, BROADCAST, DdeConfig, DdeContext, DdeMessage, Error, Message, MessageKind, Result,
};
use fxhash::FxBuildHasher;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::path::Path;
use std::process::ExitCode;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Message id used for the nested sends of `serve --nested-to`.
const NESTED_MSG: u32 = 0x7E57;

fn parse_number(value: &str) -> std::result::Result<u32, String> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("{value}: {e}"))
}

#[derive(Parser)]
#[command(name = "ddepeer")]
#[command(version)]
#[command(about = "DDE peer over SysV shared memory", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, value_name = "FILE", global = true)]
    config: Option<String>,

    #[arg(long, value_parser = parse_number, global = true)]
    key: Option<u32>,

    #[arg(long, value_name = "MS", global = true)]
    timeout_ms: Option<u64>,

    #[arg(long, value_name = "LEVEL", global = true)]
    log: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Map windows and answer messages")]
    Serve {
        #[arg(long, default_value_t = 1)]
        windows: u32,

        #[arg(long, value_name = "MS")]
        lifetime_ms: Option<u64>,

        #[arg(long, value_name = "HWND", value_parser = parse_number)]
        nested_to: Option<u32>,
    },

    #[command(about = "Send a message and print the result")]
    Send {
        #[command(flatten)]
        message: MessageArgs,
    },

    #[command(about = "Post a message")]
    Post {
        #[command(flatten)]
        message: MessageArgs,
    },

    #[command(about = "Send a message to every other process")]
    Broadcast {
        #[arg(long, value_parser = parse_number)]
        msg: u32,

        #[arg(long, default_value_t = 0)]
        wparam: u64,

        #[arg(long, default_value_t = 0)]
        lparam: u64,

        #[arg(long)]
        post: bool,
    },

    #[command(about = "Manage atoms")]
    Atom {
        #[command(subcommand)]
        action: AtomAction,
    },

    #[command(about = "Show registered processes, windows and table usage")]
    Status,
}

#[derive(clap::Args)]
struct MessageArgs {
    #[arg(long, value_parser = parse_number)]
    to: u32,

    #[arg(long, value_parser = parse_number)]
    msg: u32,

    #[arg(long, default_value_t = 0)]
    wparam: u64,

    #[arg(long, default_value_t = 0)]
    lparam: u64,

    #[arg(long, value_name = "HWND", value_parser = parse_number)]
    from: Option<u32>,
}

impl MessageArgs {
    fn message(&self) -> Message {
        let message = Message::new(self.msg).wparam(self.wparam).lparam(self.lparam);
        match self.from {
            Some(local) => message.from_window(local),
            None => message,
        }
    }
}

#[derive(Subcommand)]
enum AtomAction {
    #[command(about = "Add a reference to an atom")]
    Add { name: String },

    #[command(about = "Look up an atom")]
    Find { name: String },

    #[command(about = "Drop a reference to an atom")]
    Delete {
        #[arg(value_parser = parse_number)]
        atom: u32,
    },
}

fn load_config(cli: &Cli) -> Result<DdeConfig> {
    let mut config = DdeConfig::load(cli.config.as_deref().map(Path::new))?;
    if let Some(key) = cli.key {
        config.shm_key = key;
    }
    if let Some(timeout) = cli.timeout_ms {
        config.ack_timeout_ms = timeout;
    }
    if let Some(level) = &cli.log {
        config.log_level.clone_from(level);
    }
    config.validate()?;
    Ok(config)
}

fn kind_name(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Send => "send",
        MessageKind::Post => "post",
    }
}

fn serve(
    ctx: &mut DdeContext,
    windows: u32,
    lifetime: Option<Duration>,
    nested_to: Option<u32>,
) -> Result<()> {
    let mut remotes = Vec::new();
    for local in 1..=windows {
        remotes.push(format!("{:#x}", ctx.register_window(0x1000 + local)?));
    }

    let counts: Rc<RefCell<HashMap<u32, u64, FxBuildHasher>>> = Rc::default();
    let seen = Rc::clone(&counts);
    ctx.set_handler(move |ctx: &mut DdeContext, msg: &DdeMessage| {
        *seen.borrow_mut().entry(msg.message).or_default() += 1;
        println!(
            "MSG kind={} hwnd={:#x} msg={:#x} wparam={} lparam={} from={}",
            kind_name(msg.kind),
            msg.hwnd,
            msg.message,
            msg.wparam,
            msg.lparam,
            msg.sender_pid
        );

        let mut result = msg.wparam.wrapping_add(msg.lparam) as i64;
        if let Some(target) = nested_to
            && msg.message != NESTED_MSG
        {
            match ctx.send(target, &Message::new(NESTED_MSG).wparam(msg.wparam)) {
                Ok(nested) => result = result.wrapping_add(nested),
                Err(e) => println!("NESTED-ERROR {e}"),
            }
        }
        result
    });

    println!("READY {}", remotes.join(" "));
    let started = Instant::now();
    while lifetime.is_none_or(|lifetime| started.elapsed() < lifetime) {
        if ctx.wait_message(Duration::from_millis(50))? {
            ctx.pump()?;
        }
    }

    let mut counts: Vec<(u32, u64)> = counts.borrow().iter().map(|(k, v)| (*k, *v)).collect();
    counts.sort_unstable();
    for (message, count) in counts {
        println!("COUNT msg={message:#x} n={count}");
    }
    Ok(())
}

fn status(ctx: &DdeContext) -> Result<()> {
    let snapshot = ctx.snapshot()?;
    println!("processes: {}", snapshot.processes.len());
    for process in &snapshot.processes {
        println!(
            "  [{}] pid={} windows={} alive={}",
            process.index, process.pid, process.windows, process.alive
        );
    }
    println!("windows: {}", snapshot.windows.len());
    for window in &snapshot.windows {
        println!("  {:#x} -> {:#x} (pid {})", window.remote, window.local, window.pid);
    }
    println!(
        "atoms: {} live, {} tombstones, capacity {}",
        snapshot.atoms.live, snapshot.atoms.tombstones, snapshot.atoms.capacity
    );
    println!("handles: {}", snapshot.handles);
    println!(
        "arena: {} of {} bytes free, {} free fragments, largest {}",
        snapshot.arena.free,
        snapshot.arena.size,
        snapshot.arena.free_fragments,
        snapshot.arena.largest_free
    );
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let mut ctx = DdeContext::attach(config)?;

    match cli.command {
        Commands::Serve {
            windows,
            lifetime_ms,
            nested_to,
        } => serve(&mut ctx, windows, lifetime_ms.map(Duration::from_millis), nested_to)?,
        Commands::Send { message } => {
            let result = ctx.send(message.to, &message.message())?;
            println!("RESULT {result}");
        }
        Commands::Post { message } => {
            ctx.post(message.to, &message.message())?;
            println!("POSTED");
        }
        Commands::Broadcast {
            msg,
            wparam,
            lparam,
            post,
        } => {
            let message = Message::new(msg).wparam(wparam).lparam(lparam);
            if post {
                ctx.post(BROADCAST, &message)?;
                println!("POSTED");
            } else {
                let result = ctx.send(BROADCAST, &message)?;
                println!("RESULT {result}");
            }
        }
        Commands::Atom { action } => match action {
            AtomAction::Add { name } => println!("{}", ctx.add_atom(&name)?),
            AtomAction::Find { name } => match ctx.find_atom(&name)? {
                Some(atom) => println!("{atom}"),
                None => println!("not found"),
            },
            AtomAction::Delete { atom } => {
                let atom = u16::try_from(atom)
                    .map(Atom::new)
                    .map_err(|_| Error::Config(format!("{atom:#x} is not an atom")))?;
                ctx.delete_atom(atom)?;
                println!("deleted {atom}");
            }
        },
        Commands::Status => status(&ctx)?,
    }
    ctx.detach()
}

fn main() -> ExitCode {
    ddeshm_log::init_from_env();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            match e {
                Error::PeerUnavailable { .. } => ExitCode::from(2),
                Error::Timeout { .. } => ExitCode::from(3),
                _ => ExitCode::FAILURE,
            }
        }
    }
}
