//! Berth metadata daemon
//!
//! Opens the metadata database and either keeps it collected in the
//! background (`serve`) or runs one maintenance command against it.

use anyhow::{Context as _, Result};
use berth_common::{Config, Filter};
use berth_gc::{Scheduler, SchedulerConfig};
use berth_meta_store::snapshot::storage;
use berth_meta_store::{Context, Db, DbOptions, GcStats, LeaseManager};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "berth-meta")]
#[command(about = "Berth metadata store")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/berth/meta.toml")]
    config: String,

    /// Metadata database path (overrides the configuration)
    #[arg(long, env = "BERTH_DB")]
    db: Option<PathBuf>,

    /// Log level (overrides the configuration)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open the database and collect garbage in the background until interrupted
    Serve,
    /// Run one garbage collection and print its statistics
    Gc,
    /// List snapshot records
    Snapshots {
        #[arg(short, long, default_value = "default")]
        namespace: String,
        #[arg(short, long, default_value = "overlayfs")]
        snapshotter: String,
        /// Filters, e.g. `kind==committed`
        #[arg(short, long)]
        filter: Vec<String>,
    },
    /// List leases with their resources
    Leases {
        #[arg(short, long, default_value = "default")]
        namespace: String,
    },
    /// Print the schema version of the database
    Version,
}

/// Layer the configuration file, `BERTH_` environment variables and CLI flags
fn load_config(args: &Args) -> Result<Config> {
    let mut config: Config = ::config::Config::builder()
        .add_source(::config::File::with_name(&args.config).required(false))
        .add_source(
            ::config::Environment::with_prefix("BERTH")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("failed to load configuration from {}", args.config))?
        .try_deserialize()
        .context("invalid configuration")?;

    if let Some(db) = &args.db {
        config.metadata.path.clone_from(db);
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    Ok(config)
}

fn print_stats(stats: &GcStats) {
    let removed: serde_json::Map<_, _> = stats
        .removed
        .iter()
        .map(|(ty, n)| (ty.to_string(), json!(n)))
        .collect();
    println!(
        "{}",
        json!({
            "bytes_freed": stats.bytes_freed,
            "removed": removed,
            "mark_ms": stats.mark.as_millis(),
            "sweep_ms": stats.sweep.as_millis(),
            "total_ms": stats.total.as_millis(),
        })
    );
}

async fn serve(db: Arc<Db>, config: &Config) -> Result<()> {
    let (handle, task) = Scheduler::spawn(Arc::clone(&db), SchedulerConfig::from(config.gc.clone()));
    {
        let handle = handle.clone();
        db.register_mutation_callback(move |dirty| handle.mutation(dirty));
    }
    info!("Garbage collection scheduler started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    handle.shutdown();
    task.await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let path = config.metadata.path.clone();
    let options = DbOptions::from_config(&config.metadata);
    let db = tokio::task::spawn_blocking(move || Db::open(&path, options))
        .await?
        .with_context(|| format!("failed to open {}", config.metadata.path.display()))?;
    let db = Arc::new(db);

    match args.command {
        Commands::Serve => serve(db, &config).await?,
        Commands::Gc => {
            let stats = tokio::task::spawn_blocking(move || db.garbage_collect(&Context::background())).await??;
            print_stats(&stats);
        }
        Commands::Snapshots {
            namespace,
            snapshotter,
            filter,
        } => {
            let filter = Filter::parse_all(filter.as_slice())?;
            let ctx = Context::with_namespace_only(namespace);
            db.view(&ctx, |ctx| {
                storage::walk_info(ctx, &snapshotter, &filter, |info| {
                    println!("{}", serde_json::to_string(info).unwrap_or_default());
                    Ok(())
                })
            })?;
        }
        Commands::Leases { namespace } => {
            let ctx = Context::with_namespace_only(namespace);
            let manager = LeaseManager::new(Arc::clone(&db));
            for lease in manager.list(&ctx, &[])? {
                let resources: Vec<_> = manager
                    .list_resources(&ctx, &lease.id)?
                    .into_iter()
                    .map(|r| json!({ "type": r.kind, "id": r.id }))
                    .collect();
                println!(
                    "{}",
                    json!({
                        "id": lease.id,
                        "created_at": lease.created_at.to_rfc3339(),
                        "labels": lease.labels,
                        "resources": resources,
                    })
                );
            }
        }
        Commands::Version => {
            println!("{}", db.schema_version()?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["berth-meta"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let config = load_config(&args(&["--config", "/nonexistent/meta.toml", "version"])).unwrap();
        assert_eq!(config.gc.mutation_threshold, 100);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_file_then_flags() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[metadata]\npath = \"/tmp/from-file.redb\"\n\n[logging]\nlevel = \"debug\"\n\n[gc]\ndeletion_threshold = 3"
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = load_config(&args(&["--config", &path, "gc"])).unwrap();
        assert_eq!(config.metadata.path, PathBuf::from("/tmp/from-file.redb"));
        assert_eq!(config.gc.deletion_threshold, 3);
        assert_eq!(config.logging.level, "debug");

        let config = load_config(&args(&["--config", &path, "--db", "/tmp/flag.redb", "--log-level", "warn", "gc"])).unwrap();
        assert_eq!(config.metadata.path, PathBuf::from("/tmp/flag.redb"));
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_subcommands_parse() {
        let parsed = args(&["snapshots", "-n", "k8s.io", "-s", "native", "-f", "kind==committed"]);
        match parsed.command {
            Commands::Snapshots {
                namespace,
                snapshotter,
                filter,
            } => {
                assert_eq!(namespace, "k8s.io");
                assert_eq!(snapshotter, "native");
                assert_eq!(filter, vec!["kind==committed"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
