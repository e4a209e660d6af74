mod approval_cmds;
mod backup_cmds;
mod config;
mod context;
mod sandbox_cmds;
mod sprint_cmds;
mod worker_cmd;

use anyhow::Result;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use sibyl_db::pool;

use config::SibylConfig;
use context::RuntimeContext;

#[derive(Parser)]
#[command(name = "sibyl", about = "Multi-tenant orchestration runtime for AI coding agents")]
struct Cli {
    /// Database URL (overrides SIBYL_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Organization scope for every command
    #[arg(long, global = true, default_value = "00000000-0000-0000-0000-000000000000")]
    org: String,

    /// Project scope for sprint/task commands
    #[arg(long, global = true, default_value = "default")]
    project: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a sibyl config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/sibyl")]
        db_url: String,
        /// Redis URL for the K/V + pub/sub bus
        #[arg(long, default_value = "redis://127.0.0.1:6379/1")]
        redis_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the sibyl database (create + migrate)
    DbInit,
    /// Run the worker process (job queue, reaper, reconcile, health)
    Worker,
    /// Task management
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Sprint management
    Sprint {
        #[command(subcommand)]
        command: SprintCommands,
    },
    /// Approval management
    Approval {
        #[command(subcommand)]
        command: ApprovalCommands,
    },
    /// Sandbox lifecycle and task queue
    Sandbox {
        #[command(subcommand)]
        command: SandboxCommands,
    },
    /// Backup management
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Create a task
    Create {
        /// Task title
        name: String,
        /// Task description
        #[arg(long)]
        description: Option<String>,
        /// Priority: low, medium, high, critical
        #[arg(long, default_value = "medium")]
        priority: String,
        /// Expected LLM spend in USD (drives budget admission)
        #[arg(long)]
        estimated_cost: Option<f64>,
    },
}

#[derive(Subcommand)]
enum SprintCommands {
    /// Queue tasks onto the project sprint
    Queue {
        /// Task ids to queue
        task_ids: Vec<String>,
    },
    /// Start the sprint and supervise it to completion
    Start,
    /// Pause the sprint
    Pause {
        #[arg(long, default_value = "user_requested")]
        reason: String,
    },
    /// Resume a paused sprint
    Resume,
    /// Set the scheduling strategy
    Strategy {
        /// sequential, parallel, or priority
        strategy: String,
        /// Max concurrent task orchestrators (parallel strategy)
        #[arg(long)]
        max_concurrent: Option<u32>,
    },
    /// Set the cost budget
    Budget {
        /// Budget in USD
        budget_usd: f64,
        /// Alert threshold fraction (default 0.8)
        #[arg(long, default_value_t = 0.8)]
        alert_threshold: f64,
    },
    /// Show sprint status
    Status,
}

#[derive(Subcommand)]
enum ApprovalCommands {
    /// List pending approvals for an agent
    List {
        /// Agent id
        agent_id: String,
    },
    /// Respond to a pending approval
    Respond {
        /// Agent id the approval belongs to
        agent_id: String,
        /// Approval id
        approval_id: String,
        /// Approve (omit to deny)
        #[arg(long)]
        approve: bool,
        /// Optional response message
        #[arg(long)]
        message: Option<String>,
        /// Responder name
        #[arg(long, default_value = "human")]
        by: String,
    },
    /// Expire stale approvals for an agent
    Expire {
        /// Agent id
        agent_id: String,
    },
}

#[derive(Subcommand)]
enum SandboxCommands {
    /// Ensure an active sandbox for a user
    Ensure {
        /// User id
        user_id: Uuid,
    },
    /// Destroy a sandbox
    Destroy {
        sandbox_id: Uuid,
    },
    /// Read sandbox pod logs
    Logs {
        sandbox_id: Uuid,
        #[arg(long, default_value_t = 200)]
        tail: u32,
    },
    /// Enqueue a durable sandbox task
    Enqueue {
        sandbox_id: Uuid,
        #[arg(long, default_value = "agent_execution")]
        task_type: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// Idempotency key
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    /// Reap stale dispatched/acked tasks
    Reap {
        /// Dispatch lease TTL in seconds
        #[arg(long, default_value_t = 300)]
        dispatch_ttl: u64,
        /// Ack lease TTL in seconds
        #[arg(long, default_value_t = 1800)]
        ack_ttl: u64,
    },
    /// Report completion of a sandbox task
    Complete {
        task_id: Uuid,
        #[arg(long)]
        success: bool,
        #[arg(long)]
        error: Option<String>,
        #[arg(long)]
        retryable: bool,
    },
    /// Fail every pending task for the org (tenant rollback)
    Drain,
}

#[derive(Subcommand)]
enum BackupCommands {
    /// Run a backup now
    Run,
    /// Delete backups older than the retention window
    Cleanup {
        #[arg(long, default_value_t = 30)]
        retention_days: u32,
    },
    /// List recent backups
    List {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

/// Execute `sibyl init`: write the config file.
fn cmd_init(db_url: &str, redis_url: &str, force: bool) -> Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_owned(),
        },
        redis: config::RedisSection {
            url: redis_url.to_owned(),
        },
        sandbox: config::SandboxSection::default(),
        backup: config::BackupSection::default(),
    };
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  redis.url = {redis_url}");
    println!();
    println!("Next: run `sibyl db-init` to create and migrate the database.");
    Ok(())
}

/// Execute `sibyl db-init`: create the database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> Result<()> {
    let resolved = SibylConfig::resolve(cli_db_url)?;

    println!("Initializing sibyl database...");
    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;
    db_pool.close().await;
    println!("sibyl db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Config-only commands run before any runtime wiring.
    match &cli.command {
        Commands::Init {
            db_url,
            redis_url,
            force,
        } => return cmd_init(db_url, redis_url, *force),
        Commands::DbInit => return cmd_db_init(cli.database_url.as_deref()).await,
        _ => {}
    }

    let resolved = SibylConfig::resolve(cli.database_url.as_deref())?;
    let org_uuid: Uuid = cli
        .org
        .parse()
        .map_err(|_| anyhow::anyhow!("--org must be a UUID"))?;
    let ctx = RuntimeContext::build(resolved, &cli.org, &cli.project).await?;

    let result = match cli.command {
        Commands::Init { .. } | Commands::DbInit => unreachable!("handled above"),
        Commands::Worker => worker_cmd::cmd_worker(&ctx).await,
        Commands::Task { command } => match command {
            TaskCommands::Create {
                name,
                description,
                priority,
                estimated_cost,
            } => {
                sprint_cmds::cmd_task_create(
                    &ctx,
                    &cli.project,
                    &name,
                    description.as_deref(),
                    &priority,
                    estimated_cost,
                )
                .await
            }
        },
        Commands::Sprint { command } => match command {
            SprintCommands::Queue { task_ids } => sprint_cmds::cmd_queue(&ctx, &task_ids).await,
            SprintCommands::Start => sprint_cmds::cmd_start(&ctx).await,
            SprintCommands::Pause { reason } => sprint_cmds::cmd_pause(&ctx, &reason).await,
            SprintCommands::Resume => sprint_cmds::cmd_resume(&ctx).await,
            SprintCommands::Strategy {
                strategy,
                max_concurrent,
            } => sprint_cmds::cmd_strategy(&ctx, &strategy, max_concurrent).await,
            SprintCommands::Budget {
                budget_usd,
                alert_threshold,
            } => sprint_cmds::cmd_budget(&ctx, budget_usd, alert_threshold).await,
            SprintCommands::Status => sprint_cmds::cmd_status(&ctx).await,
        },
        Commands::Approval { command } => match command {
            ApprovalCommands::List { agent_id } => {
                approval_cmds::cmd_list(&ctx, &cli.project, &agent_id).await
            }
            ApprovalCommands::Respond {
                agent_id,
                approval_id,
                approve,
                message,
                by,
            } => {
                approval_cmds::cmd_respond(
                    &ctx,
                    &cli.project,
                    &agent_id,
                    &approval_id,
                    approve,
                    message.as_deref(),
                    &by,
                )
                .await
            }
            ApprovalCommands::Expire { agent_id } => {
                approval_cmds::cmd_expire(&ctx, &cli.project, &agent_id).await
            }
        },
        Commands::Sandbox { command } => match command {
            SandboxCommands::Ensure { user_id } => {
                sandbox_cmds::cmd_ensure(&ctx, org_uuid, user_id).await
            }
            SandboxCommands::Destroy { sandbox_id } => {
                sandbox_cmds::cmd_destroy(&ctx, org_uuid, sandbox_id).await
            }
            SandboxCommands::Logs { sandbox_id, tail } => {
                sandbox_cmds::cmd_logs(&ctx, org_uuid, sandbox_id, tail).await
            }
            SandboxCommands::Enqueue {
                sandbox_id,
                task_type,
                payload,
                idempotency_key,
            } => {
                sandbox_cmds::cmd_enqueue(
                    &ctx,
                    org_uuid,
                    sandbox_id,
                    &task_type,
                    payload.as_deref(),
                    idempotency_key.as_deref(),
                )
                .await
            }
            SandboxCommands::Reap {
                dispatch_ttl,
                ack_ttl,
            } => sandbox_cmds::cmd_reap(&ctx, dispatch_ttl, ack_ttl).await,
            SandboxCommands::Complete {
                task_id,
                success,
                error,
                retryable,
            } => {
                sandbox_cmds::cmd_complete(
                    &ctx,
                    org_uuid,
                    task_id,
                    success,
                    error.as_deref(),
                    retryable,
                )
                .await
            }
            SandboxCommands::Drain => sandbox_cmds::cmd_drain(&ctx, org_uuid).await,
        },
        Commands::Backup { command } => match command {
            BackupCommands::Run => backup_cmds::cmd_run(&ctx, org_uuid).await,
            BackupCommands::Cleanup { retention_days } => {
                backup_cmds::cmd_cleanup(&ctx, org_uuid, retention_days).await
            }
            BackupCommands::List { limit } => backup_cmds::cmd_list(&ctx, org_uuid, limit).await,
        },
    };

    ctx.pool.close().await;

    if let Err(e) = result {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
    Ok(())
}
