use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Reset SIGPIPE to default behavior so piping (e.g. `iacore task list | head`)
/// exits cleanly instead of panicking on broken pipe.
#[cfg(unix)]
fn reset_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use iacore::config::{self, Config};
use iacore::db::models::{task_status, NewWorkspace, Task};
use iacore::db::tasks::NewTask;
use iacore::db::{Database, TaskFilter};
use iacore::executor::TaskKind;
use iacore::index::{ResourceIndexer, SearchFilter, TreeNode, TreeNodeKind};
use iacore::state::StateManager;
use iacore::triggers::RunTriggerService;
use iacore::variables::{NewVariable, VariableStore};
use iacore::Runtime;

const CLI_LOCK_HOLDER: &str = "cli";

/// iacore - execution core for infrastructure-as-code workspaces
#[derive(Parser)]
#[command(name = "iacore", version, about, long_about = None)]
struct Cli {
    /// Path to the SQLite database (overrides the config file)
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Path to a YAML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the queue, embedding worker and sweeper until interrupted
    Serve {
        /// Seconds to wait for running tasks on shutdown
        #[arg(long, default_value = "30")]
        shutdown_timeout: u64,
    },

    /// Workspace management
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },

    /// Task queue operations
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// State version management
    State {
        #[command(subcommand)]
        command: StateCommands,
    },

    /// Resource index operations
    Index {
        #[command(subcommand)]
        command: IndexCommands,
    },

    /// Search indexed resources across workspaces
    Search {
        query: String,

        /// Restrict to one workspace (id or name)
        #[arg(short, long)]
        workspace: Option<String>,

        /// Restrict to one resource type
        #[arg(short = 't', long)]
        resource_type: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Run trigger management
    Trigger {
        #[command(subcommand)]
        command: TriggerCommands,
    },

    /// Workspace variable management
    Variable {
        #[command(subcommand)]
        command: VariableCommands,
    },
}

#[derive(Subcommand)]
enum WorkspaceCommands {
    /// Create a new workspace
    Create {
        name: String,

        /// Directory or archive holding the terraform sources
        #[arg(long)]
        source: Option<String>,

        /// Apply plan_and_apply tasks without confirmation
        #[arg(long)]
        auto_apply: bool,

        #[arg(long, default_value = "")]
        description: String,
    },
    /// List workspaces
    List,
    /// Lock a workspace
    Lock {
        workspace: String,
        #[arg(long, default_value = "Locked from CLI")]
        reason: String,
    },
    /// Unlock a workspace regardless of holder
    Unlock { workspace: String },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Queue a task; a running server picks it up
    Create {
        workspace: String,

        /// plan, plan_and_apply, apply or drift_check
        #[arg(short = 't', long = "type", default_value = "plan")]
        task_type: String,

        #[arg(long, default_value = "")]
        description: String,

        /// Plan task whose stored plan an apply task executes
        #[arg(long)]
        plan_task: Option<i64>,

        #[arg(long)]
        user: Option<String>,
    },
    /// List tasks
    List {
        #[arg(short, long)]
        workspace: Option<String>,

        /// needs_attention, errored, running, on_hold, success, cancelled or all
        #[arg(short, long, default_value = "all")]
        filter: String,

        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
    /// Cancel a pending task
    Cancel { id: i64 },
    /// Confirm the apply of a parked plan_and_apply task
    Confirm {
        id: i64,
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// Discard a parked plan
    Discard {
        id: i64,
        #[arg(long, default_value = "cli")]
        user: String,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    /// Upload a state file as a new version
    Upload {
        workspace: String,
        file: PathBuf,

        /// Skip lineage and serial checks
        #[arg(long)]
        force: bool,

        #[arg(long, default_value = "Uploaded from CLI")]
        description: String,
    },
    /// Restore an older version as the new latest
    Rollback {
        workspace: String,
        version: i64,

        #[arg(long, default_value = "Rollback from CLI")]
        reason: String,

        #[arg(long)]
        force: bool,
    },
    /// List state versions
    List {
        workspace: String,
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
    /// Print the content of a state version (latest by default)
    Show {
        workspace: String,
        version: Option<i64>,
    },
}

#[derive(Subcommand)]
enum IndexCommands {
    /// Rebuild the resource index from the latest state
    Sync { workspace: String },
    /// Print the module/resource tree
    Tree { workspace: String },
}

#[derive(Subcommand)]
enum TriggerCommands {
    /// Run `target` after each successful apply of `source`
    Add {
        source: String,
        target: String,
        #[arg(long)]
        user: Option<String>,
    },
    /// List triggers of a workspace
    List { workspace: String },
    /// Delete a trigger
    Remove { id: i64 },
}

#[derive(Subcommand)]
enum VariableCommands {
    /// Create a variable
    Set {
        workspace: String,
        key: String,
        value: String,

        /// Export as an environment variable instead of a terraform variable
        #[arg(long)]
        env: bool,

        #[arg(long)]
        sensitive: bool,
    },
    /// List active variables
    List { workspace: String },
    /// Soft-delete a variable by id
    Delete { variable_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    #[cfg(unix)]
    reset_sigpipe();

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = load_config(&cli)?;
    let db = Arc::new(
        Database::open(&config.database.path)
            .with_context(|| format!("failed to open database {}", config.database.path.display()))?,
    );

    match cli.command {
        Commands::Serve { shutdown_timeout } => cmd_serve(db, config, shutdown_timeout).await,
        Commands::Workspace { ref command } => cmd_workspace(&db, command),
        Commands::Task { ref command } => cmd_task(&db, command),
        Commands::State { ref command } => cmd_state(db, command),
        Commands::Index { ref command } => cmd_index(db, command),
        Commands::Search {
            ref query,
            ref workspace,
            ref resource_type,
            limit,
        } => cmd_search(db, query, workspace.as_deref(), resource_type.clone(), limit),
        Commands::Trigger { ref command } => cmd_trigger(db, command),
        Commands::Variable { ref command } => cmd_variable(db, command),
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(path) = &cli.database {
        config.database.path = path.clone();
    }
    Ok(config)
}

fn workspace_id(db: &Database, id_or_name: &str) -> Result<String> {
    Ok(db.resolve_workspace(id_or_name)?.workspace_id)
}

fn status_colored(status: &str) -> colored::ColoredString {
    match status {
        task_status::SUCCESS | task_status::APPLIED => status.green(),
        task_status::FAILED => status.red(),
        task_status::RUNNING => status.cyan(),
        task_status::APPLY_PENDING => status.yellow().bold(),
        task_status::CANCELLED => status.dimmed(),
        _ => status.normal(),
    }
}

fn print_task_line(task: &Task) {
    println!(
        "  #{:<6} {:<16} {:<15} {:<14} {}",
        task.id,
        task.workspace_id,
        task.task_type,
        status_colored(&task.status),
        task.description
    );
    if let Some(err) = &task.error_message {
        println!("          {}", err.red());
    }
}

// ─── Commands ────────────────────────────────────────────────────────────────

async fn cmd_serve(db: Arc<Database>, config: Config, shutdown_timeout: u64) -> Result<()> {
    let runtime = Runtime::new(db, config)?;
    println!(
        "{} iacore serving (max {} parallel tasks). Press Ctrl-C to stop.",
        "▶".cyan().bold(),
        runtime.config.queue.max_parallel
    );
    runtime.serve(Duration::from_secs(shutdown_timeout)).await?;
    println!("{} Shut down.", "✓".green().bold());
    Ok(())
}

fn cmd_workspace(db: &Database, command: &WorkspaceCommands) -> Result<()> {
    match command {
        WorkspaceCommands::Create {
            name,
            source,
            auto_apply,
            description,
        } => {
            let mut new = NewWorkspace::named(name.as_str());
            new.source_path = source.clone();
            new.auto_apply = *auto_apply;
            new.description = description.clone();
            let ws = db.create_workspace(&new)?;
            println!(
                "{} Created workspace {} ({})",
                "✓".green().bold(),
                ws.name.bold(),
                ws.workspace_id
            );
        }
        WorkspaceCommands::List => {
            let workspaces = db.list_workspaces()?;
            if workspaces.is_empty() {
                println!("No workspaces.");
                return Ok(());
            }
            println!(
                "{:<16} {:<24} {:<14} {}",
                "ID".bold(),
                "NAME".bold(),
                "STATE".bold(),
                "LOCK".bold()
            );
            println!("{}", "─".repeat(70));
            for ws in &workspaces {
                let lock = if ws.is_locked {
                    format!(
                        "{} {} ({})",
                        "locked".red(),
                        ws.locked_by.as_deref().unwrap_or("-"),
                        ws.lock_reason
                    )
                } else {
                    "-".dimmed().to_string()
                };
                println!(
                    "{:<16} {:<24} {:<14} {}",
                    ws.workspace_id, ws.name, ws.state, lock
                );
            }
        }
        WorkspaceCommands::Lock { workspace, reason } => {
            let id = workspace_id(db, workspace)?;
            db.lock_workspace(&id, CLI_LOCK_HOLDER, reason)?;
            println!("{} Locked {}", "✓".green().bold(), id.bold());
        }
        WorkspaceCommands::Unlock { workspace } => {
            let id = workspace_id(db, workspace)?;
            if db.unlock_workspace(&id, None)? {
                println!("{} Unlocked {}", "✓".green().bold(), id.bold());
            } else {
                println!("Workspace {} was not locked.", id);
            }
        }
    }
    Ok(())
}

fn cmd_task(db: &Database, command: &TaskCommands) -> Result<()> {
    match command {
        TaskCommands::Create {
            workspace,
            task_type,
            description,
            plan_task,
            user,
        } => {
            let kind = TaskKind::parse(task_type)?;
            let ws = db.resolve_workspace(workspace)?;
            let task = db.insert_task(&NewTask {
                workspace_id: ws.workspace_id.clone(),
                task_type: kind.as_str().to_string(),
                description: description.clone(),
                created_by: user.clone(),
                max_retries: ws.max_retries,
                plan_task_id: *plan_task,
            })?;
            println!(
                "{} Queued {} task #{} for {}",
                "+".green(),
                task.task_type,
                task.id,
                ws.name.bold()
            );
        }
        TaskCommands::List {
            workspace,
            filter,
            limit,
        } => {
            let filter: TaskFilter = filter.parse()?;
            let ws = match workspace {
                Some(w) => Some(workspace_id(db, w)?),
                None => None,
            };
            let tasks = db.list_tasks(ws.as_deref(), filter, *limit, 0)?;
            let counts = db.filter_counts(ws.as_deref())?;
            let summary: Vec<String> = counts
                .iter()
                .map(|(f, n)| format!("{} {}", f.as_str(), n))
                .collect();
            println!("{}", summary.join("  ").dimmed());
            println!("{}", "─".repeat(70));
            if tasks.is_empty() {
                println!("No tasks.");
            }
            for task in &tasks {
                print_task_line(task);
            }
        }
        TaskCommands::Cancel { id } => {
            let task = db.get_task(*id)?;
            if task.status == task_status::RUNNING {
                bail!("task #{} is running; cancel it through the serving process", id);
            }
            if !db.cancel_queued_task(*id, iacore::executor::CANCELLED_MESSAGE)? {
                bail!("task #{} cannot be cancelled (status: {})", id, task.status);
            }
            println!("{} Cancelled task #{}", "✓".green().bold(), id);
        }
        TaskCommands::Confirm { id, user } => {
            let task = db.get_task(*id)?;
            if TaskKind::parse(&task.task_type)? != TaskKind::PlanAndApply {
                bail!("task #{} is a {} task, only plan_and_apply tasks can be confirmed", id, task.task_type);
            }
            let task = db.confirm_apply(*id, user)?;
            println!(
                "{} Confirmed apply of task #{}; it resumes on the next dispatch",
                "✓".green().bold(),
                task.id
            );
        }
        TaskCommands::Discard { id, user } => {
            let task = db.get_task(*id)?;
            if task.status != task_status::APPLY_PENDING {
                bail!("task #{} is not in apply_pending status (status: {})", id, task.status);
            }
            db.cancel_queued_task(*id, &format!("Plan discarded by {}", user))?;
            println!("{} Discarded plan of task #{}", "✓".green().bold(), id);
        }
    }
    Ok(())
}

fn cmd_state(db: Arc<Database>, command: &StateCommands) -> Result<()> {
    let indexer = Arc::new(ResourceIndexer::new(Arc::clone(&db)));
    let manager = StateManager::new(Arc::clone(&db)).with_indexer(indexer);
    match command {
        StateCommands::Upload {
            workspace,
            file,
            force,
            description,
        } => {
            let id = workspace_id(&db, workspace)?;
            let content = read_file(file)?;
            let version = manager.upload_state(&id, &content, Some(CLI_LOCK_HOLDER), *force, description)?;
            println!(
                "{} Uploaded state version {} (serial {}, {} bytes)",
                "✓".green().bold(),
                version.version,
                version.serial,
                version.size_bytes
            );
            if *force {
                println!(
                    "  {} workspace stays locked after a forced upload; run `iacore workspace unlock {}`",
                    "!".yellow(),
                    workspace
                );
            }
        }
        StateCommands::Rollback {
            workspace,
            version,
            reason,
            force,
        } => {
            let id = workspace_id(&db, workspace)?;
            let restored = manager.rollback_to(&id, *version, Some(CLI_LOCK_HOLDER), reason, *force)?;
            println!(
                "{} Rolled back to version {} as version {}",
                "✓".green().bold(),
                version,
                restored.version
            );
        }
        StateCommands::List { workspace, limit } => {
            let id = workspace_id(&db, workspace)?;
            let versions = manager.list(&id, *limit, 0)?;
            if versions.is_empty() {
                println!("No state versions.");
                return Ok(());
            }
            println!(
                "{:<8} {:<8} {:<10} {:<28} {}",
                "VERSION".bold(),
                "SERIAL".bold(),
                "SIZE".bold(),
                "CREATED".bold(),
                "DESCRIPTION".bold()
            );
            println!("{}", "─".repeat(80));
            for v in &versions {
                let mut desc = v.description.clone();
                if let Some(from) = v.rollback_from_version {
                    desc = format!("{} {}", format!("[rollback of v{}]", from).yellow(), desc);
                } else if v.is_imported {
                    desc = format!("{} {}", "[imported]".cyan(), desc);
                }
                println!(
                    "{:<8} {:<8} {:<10} {:<28} {}",
                    v.version, v.serial, v.size_bytes, v.created_at, desc
                );
            }
        }
        StateCommands::Show { workspace, version } => {
            let id = workspace_id(&db, workspace)?;
            let state = match version {
                Some(v) => manager.get_version(&id, *v)?,
                None => match manager.get_latest(&id)? {
                    Some(s) => s,
                    None => bail!("workspace {} has no state versions", workspace),
                },
            };
            println!("{}", state.content.unwrap_or_default());
        }
    }
    Ok(())
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn cmd_index(db: Arc<Database>, command: &IndexCommands) -> Result<()> {
    let indexer = ResourceIndexer::new(Arc::clone(&db));
    match command {
        IndexCommands::Sync { workspace } => {
            let id = workspace_id(&db, workspace)?;
            let report = indexer.sync(&id)?;
            println!("{} Indexed {}: {}", "✓".green().bold(), id.bold(), report);
        }
        IndexCommands::Tree { workspace } => {
            let id = workspace_id(&db, workspace)?;
            let tree = indexer.resource_tree(&id)?;
            if tree.is_empty() {
                println!("No indexed resources.");
            }
            for node in &tree {
                print_tree_node(node, 0);
            }
        }
    }
    Ok(())
}

fn print_tree_node(node: &TreeNode, depth: usize) {
    let indent = "  ".repeat(depth);
    match node.kind {
        TreeNodeKind::Module => println!(
            "{}{} {} ({} resources)",
            indent,
            "▸".cyan(),
            node.name.bold(),
            node.resource_count
        ),
        TreeNodeKind::Resource => {
            let cloud = node
                .cloud_id
                .as_deref()
                .map(|id| format!(" → {}", id).dimmed().to_string())
                .unwrap_or_default();
            println!("{}  {}{}", indent, node.path, cloud);
        }
    }
    for child in &node.children {
        print_tree_node(child, depth + 1);
    }
}

fn cmd_search(
    db: Arc<Database>,
    query: &str,
    workspace: Option<&str>,
    resource_type: Option<String>,
    limit: Option<usize>,
) -> Result<()> {
    let workspace_id = match workspace {
        Some(w) => Some(workspace_id(&db, w)?),
        None => None,
    };
    let indexer = ResourceIndexer::new(Arc::clone(&db));
    let hits = indexer.search(
        query,
        &SearchFilter {
            workspace_id,
            resource_type,
            limit,
        },
    )?;
    if hits.is_empty() {
        println!("No matches for '{}'.", query);
        return Ok(());
    }
    for hit in &hits {
        let address = hit.terraform_address.as_deref().unwrap_or(&hit.resource_name);
        println!(
            "  {:>5.1}  {}  {}  {}",
            hit.match_rank,
            hit.workspace_name.as_deref().unwrap_or(&hit.workspace_id).dimmed(),
            address.bold(),
            hit.cloud_resource_id.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn cmd_trigger(db: Arc<Database>, command: &TriggerCommands) -> Result<()> {
    let service = RunTriggerService::new(Arc::clone(&db));
    match command {
        TriggerCommands::Add { source, target, user } => {
            let source = workspace_id(&db, source)?;
            let target = workspace_id(&db, target)?;
            let trigger = service.create_trigger(&source, &target, user.as_deref())?;
            println!(
                "{} Trigger #{}: {} → {}",
                "✓".green().bold(),
                trigger.id,
                source.bold(),
                target.bold()
            );
        }
        TriggerCommands::List { workspace } => {
            let id = workspace_id(&db, workspace)?;
            let outgoing = service.list_by_source(&id)?;
            let incoming = service.list_by_target(&id)?;
            println!("{}", "Triggers".bold());
            println!("{}", "─".repeat(60));
            for t in &outgoing {
                println!(
                    "  #{:<5} {} → {} {}",
                    t.id,
                    id,
                    t.target_workspace_id.bold(),
                    if t.enabled { "".normal() } else { "(disabled)".dimmed() }
                );
            }
            for t in &incoming {
                println!(
                    "  #{:<5} {} → {} {}",
                    t.id,
                    t.source_workspace_id.bold(),
                    id,
                    if t.enabled { "".normal() } else { "(disabled)".dimmed() }
                );
            }
            if outgoing.is_empty() && incoming.is_empty() {
                println!("  No triggers.");
            }
        }
        TriggerCommands::Remove { id } => {
            service.delete_trigger(*id)?;
            println!("{} Removed trigger #{}", "✓".green().bold(), id);
        }
    }
    Ok(())
}

fn cmd_variable(db: Arc<Database>, command: &VariableCommands) -> Result<()> {
    let store = VariableStore::new(Arc::clone(&db));
    match command {
        VariableCommands::Set {
            workspace,
            key,
            value,
            env,
            sensitive,
        } => {
            let id = workspace_id(&db, workspace)?;
            let mut new = if *env {
                NewVariable::environment(key, value)
            } else {
                NewVariable::terraform(key, value)
            };
            if *sensitive {
                new = new.sensitive();
            }
            let var = store.create(&id, &new)?;
            println!(
                "{} Set {} ({}, {})",
                "✓".green().bold(),
                var.key.bold(),
                var.variable_type,
                var.variable_id
            );
        }
        VariableCommands::List { workspace } => {
            let id = workspace_id(&db, workspace)?;
            let vars = store.list(&id, None)?;
            if vars.is_empty() {
                println!("No variables.");
                return Ok(());
            }
            for var in &vars {
                let value = if var.sensitive {
                    "(sensitive)".dimmed().to_string()
                } else {
                    var.value.clone()
                };
                println!(
                    "  {:<20} {:<12} {:<28} = {}",
                    var.variable_id,
                    var.variable_type,
                    var.key.bold(),
                    value
                );
            }
        }
        VariableCommands::Delete { variable_id } => {
            store.delete(variable_id)?;
            println!("{} Deleted {}", "✓".green().bold(), variable_id);
        }
    }
    Ok(())
}
