use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use repocache::{AppContext, Config, FingerprintComputer, GitCli, RepoEvent};
use serde::Serialize;
use serde_json::json;
use std::error::Error;
use std::io;
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "repocache")]
#[command(author, version, about = "Repository state cache with change notification")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose logging (same as RUST_LOG=debug)
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List projects, most recently opened first
    Projects,

    /// Register a repository
    Add {
        path: PathBuf,

        /// Display name (default: directory name)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Mark a project as opened
    Open { id: String },

    /// Delete a project and everything cached for it
    Remove { id: String },

    /// Print the fingerprint of a repository
    Fingerprint { path: PathBuf },

    /// Load the tree/status snapshot, from cache when still valid
    Snapshot {
        id: String,

        #[arg(long)]
        include_ignored: bool,
    },

    /// Drop a project's repo and patch cache rows
    Invalidate { id: String },

    /// Run a retention sweep
    Prune,

    /// Cache sizes and entry counts
    Stats,

    /// Print events for a project as JSON lines
    Watch {
        id: String,

        /// Stop after this many seconds (default: run until killed)
        #[arg(short, long)]
        seconds: Option<u64>,
    },

    /// Generate shell completions
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

type CliResult = Result<(), Box<dyn Error>>;

fn main() {
    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(command: Command) -> CliResult {
    match command {
        Command::Completion { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "repocache", &mut io::stdout());
            Ok(())
        }
        Command::Fingerprint { path } => {
            let git = GitCli::default();
            let fingerprint = FingerprintComputer::new(&git).compute(&path)?;
            print_json(&fingerprint)
        }
        Command::Projects => with_context(|ctx| print_json(&ctx.db().list_projects()?)),
        Command::Add { path, name } => with_context(|ctx| print_json(&ctx.add_project(&path, name.as_deref())?)),
        Command::Open { id } => with_context(|ctx| print_json(&ctx.open_project(&id)?)),
        Command::Remove { id } => with_context(|ctx| {
            if !ctx.remove_project(&id)? {
                return Err(format!("no project with id {}", id).into());
            }
            print_json(&json!({ "removed": id }))
        }),
        Command::Snapshot { id, include_ignored } => with_context(|ctx| {
            let result = ctx.load_repo_snapshot(&id, include_ignored);
            if let Err(e) = &result {
                ctx.report_error(Some(id.as_str()), e);
            }
            print_json(&result?)
        }),
        Command::Invalidate { id } => with_context(|ctx| {
            let removed = ctx.invalidate(&id)?;
            print_json(&json!({ "projectId": id, "removed": removed }))
        }),
        Command::Prune => with_context(|ctx| print_json(&ctx.run_retention()?)),
        Command::Stats => with_context(|ctx| {
            let db = ctx.db();
            let stats = db.cache_stats()?;
            print_json(&json!({
                "database": db.path(),
                "schemaVersion": db.schema_version()?,
                "projects": db.list_projects()?.len(),
                "repoEntries": stats.repo_entries,
                "repoBytes": stats.repo_bytes,
                "patchEntries": stats.patch_entries,
                "patchBytes": stats.patch_bytes,
                "logEntries": stats.log_entries,
                "totalBytes": stats.total_bytes(),
            }))
        }),
        Command::Watch { id, seconds } => with_context(|ctx| watch(ctx, &id, seconds.map(Duration::from_secs))),
    }
}

/// Open the store for one command and shut the watcher down afterwards
fn with_context(f: impl FnOnce(&AppContext) -> CliResult) -> CliResult {
    let ctx = AppContext::init(Config::load())?;
    let result = f(&ctx);
    ctx.close();
    result
}

fn watch(ctx: &AppContext, id: &str, limit: Option<Duration>) -> CliResult {
    let events = ctx.subscribe();
    let project = ctx.open_project(id)?;
    ctx.check_conflicts(&project.id)?;
    eprintln!("Watching {} ({})", project.name, project.path);

    let deadline = limit.map(|d| Instant::now() + d);
    loop {
        let wait = match deadline {
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(left) => left,
                None => return Ok(()),
            },
            None => Duration::from_secs(3600),
        };

        match events.recv_timeout(wait) {
            Ok(event) => {
                println!("{}", serde_json::to_string(&event)?);
                if let RepoEvent::RepoUpdated(update) = &event {
                    if let Err(e) = ctx.check_conflicts(&update.project_id) {
                        ctx.report_error(Some(update.project_id.as_str()), &e);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
