mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commands::load_payload;
use std::collections::BTreeMap;

#[derive(Parser)]
#[command(name = "obx")]
#[command(about = "Transactional outbox dispatcher operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> region...)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Cluster-wide record and instance status
    Status,

    /// Manually enqueue a record (operator / test convenience — production
    /// producers call obx_db::schedule directly inside their own
    /// transaction instead of going through the CLI).
    Schedule {
        #[arg(long)]
        payload_type: String,

        #[arg(long)]
        payload: Option<String>,

        #[arg(long = "payload-file")]
        payload_file: Option<String>,

        #[arg(long)]
        key: String,

        /// Repeatable `--context key=value` pairs.
        #[arg(long = "context", value_parser = parse_context_pair)]
        context: Vec<(String, String)>,

        #[arg(long)]
        idempotency_key: Option<String>,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = obx_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = obx_db::status(&pool).await?;
                    println!("db_ok={} has_records_table={}", s.ok, s.has_records_table);
                }
                DbCmd::Migrate => {
                    obx_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = obx_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Status => {
            let pool = obx_db::connect_from_env().await?;
            let counts = obx_db::record_status_counts(&pool).await?;
            let stale_after = chrono::Utc::now() - chrono::Duration::seconds(30);
            let instances = obx_db::list_live(&pool, stale_after).await?;
            println!("live_instances={}", instances.len());
            for instance in &instances {
                println!("  {}", instance.instance_id);
            }
            println!(
                "records pending={} claimed={} retry_scheduled={} completed={} failed={}",
                counts.pending, counts.claimed, counts.retry_scheduled, counts.completed, counts.failed
            );
        }

        Commands::Schedule { payload_type, payload, payload_file, key, context, idempotency_key } => {
            let pool = obx_db::connect_from_env().await?;
            let payload_json = load_payload(payload, payload_file).context("resolve --payload")?;
            let context: BTreeMap<String, String> = context.into_iter().collect();

            let id = obx_db::schedule(
                &pool,
                &payload_type,
                payload_json,
                Some(key.as_str()),
                context,
                idempotency_key.as_deref(),
            )
            .await?;

            match id {
                Some(id) => println!("record_id={id}"),
                None => println!("deduplicated=true (idempotency_key already scheduled)"),
            }
        }
    }

    Ok(())
}

fn parse_context_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) => Ok((k.to_string(), v.to_string())),
        None => Err(format!("expected key=value, got {s:?}")),
    }
}
