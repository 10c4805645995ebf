mod agent_cmds;
mod config;
mod dispatch_cmd;
mod queue_cmds;
mod serve_cmd;

#[cfg(test)]
mod test_util;

use anyhow::Context;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use foreman_db::pool;

use config::ForemanConfig;

#[derive(Parser)]
#[command(name = "foreman", about = "Distributed CI/CD build master")]
struct Cli {
    /// Database URL (overrides FOREMAN_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a foreman config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/foreman")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the foreman database (requires config file or env vars)
    DbInit,
    /// Agent admin commands (register, heartbeat, deregister, list, drain, summary)
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// Build queue introspection (depth, oldest age, dead-letter listing)
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Exercise the dispatch decision directly
    Dispatch {
        build_id: String,
        job_id: String,
        /// JSON payload (defaults to `{}`)
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Required labels, comma-separated
        #[arg(long, value_delimiter = ',')]
        labels: Vec<String>,
        #[arg(long)]
        org_id: Option<String>,
        #[arg(long)]
        cpu: Option<i32>,
        #[arg(long)]
        memory_gb: Option<f64>,
    },
    /// Run the admin server and background loops (queue processor, orphan monitor)
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        #[arg(long, default_value_t = 7420)]
        port: u16,
    },
}

#[derive(Subcommand)]
enum AgentCommands {
    /// Register a new agent
    Register {
        url: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, value_delimiter = ',')]
        labels: Vec<String>,
        #[arg(long)]
        max_builds: Option<i32>,
        #[arg(long)]
        cpu: Option<i32>,
        #[arg(long)]
        memory_gb: Option<f64>,
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        org_id: Option<String>,
    },
    /// Record a heartbeat for an agent
    Heartbeat {
        id: Uuid,
        #[arg(long)]
        current_builds: Option<i32>,
    },
    /// Remove an agent
    Deregister { id: Uuid },
    /// Mark an agent draining (stop scheduling new builds to it)
    Drain { id: Uuid },
    /// List registered agents
    List {
        #[arg(long)]
        org_id: Option<String>,
    },
    /// Show agent status counts
    Summary {
        #[arg(long)]
        org_id: Option<String>,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Show pending queue depth
    Depth,
    /// Show the age of the oldest pending item
    OldestAge,
    /// List dead-lettered items
    DeadLetter {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Show a single queue item by build id
    Show { build_id: String },
}

/// Execute `foreman init`: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let auth_token = config::generate_auth_token();

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        distributed: config::DistributedSection {
            auth_token: Some(auth_token.clone()),
            ..Default::default()
        },
        dispatch: config::DispatchSection::default(),
        feature_flags: config::FeatureFlagsSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  distributed.auth_token = {}...{}", &auth_token[..8], &auth_token[56..]);
    println!();
    println!("Next: run `foreman db-init` to create and migrate the database.");

    Ok(())
}

/// Execute `foreman db-init`: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = ForemanConfig::resolve(cli_db_url)?;

    println!("Initializing foreman database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("foreman db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Agent { command } => {
            let resolved = ForemanConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = run_agent_command(command, &db_pool, &resolved).await;
            db_pool.close().await;
            result?;
        }
        Commands::Queue { command } => {
            let resolved = ForemanConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = run_queue_command(command, &db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Dispatch {
            build_id,
            job_id,
            payload,
            labels,
            org_id,
            cpu,
            memory_gb,
        } => {
            let resolved = ForemanConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("--payload must be valid JSON")?;
            let result = dispatch_cmd::run_dispatch(
                &db_pool, &resolved, &build_id, &job_id, payload, labels, org_id, cpu, memory_gb,
            )
            .await;
            db_pool.close().await;
            result?;
        }
        Commands::Serve { bind, port } => {
            let resolved = ForemanConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            serve_cmd::run_serve(db_pool, resolved, &bind, port).await?;
        }
    }

    Ok(())
}

async fn run_agent_command(command: AgentCommands, pool: &sqlx::PgPool, config: &ForemanConfig) -> anyhow::Result<()> {
    match command {
        AgentCommands::Register {
            url,
            name,
            labels,
            max_builds,
            cpu,
            memory_gb,
            region,
            org_id,
        } => {
            agent_cmds::register(
                pool,
                config.heartbeat_timeout,
                name,
                url,
                labels,
                max_builds,
                cpu,
                memory_gb,
                region,
                org_id,
            )
            .await
        }
        AgentCommands::Heartbeat { id, current_builds } => {
            agent_cmds::heartbeat(pool, config.heartbeat_timeout, id, current_builds).await
        }
        AgentCommands::Deregister { id } => agent_cmds::deregister(pool, id).await,
        AgentCommands::Drain { id } => agent_cmds::drain(pool, id).await,
        AgentCommands::List { org_id } => agent_cmds::list(pool, org_id.as_deref()).await,
        AgentCommands::Summary { org_id } => agent_cmds::summary(pool, org_id.as_deref()).await,
    }
}

async fn run_queue_command(command: QueueCommands, pool: &sqlx::PgPool) -> anyhow::Result<()> {
    match command {
        QueueCommands::Depth => queue_cmds::depth(pool).await,
        QueueCommands::OldestAge => queue_cmds::oldest_age(pool).await,
        QueueCommands::DeadLetter { limit } => queue_cmds::dead_letter(pool, limit).await,
        QueueCommands::Show { build_id } => queue_cmds::show(pool, &build_id).await,
    }
}
