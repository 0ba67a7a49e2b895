//! AIPscan Aggregator - storage service fetch tool

use aipscan_aggregator::admin;
use aipscan_aggregator::config::AggregatorConfig;
use aipscan_aggregator::db::{self, NewStorageService, Store};
use aipscan_aggregator::ingest::{FetchCoordinator, PageSelection};
use aipscan_common::logging::{init_logging, LogConfig, LogLevel};
use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "aipscan-aggregator")]
#[command(author, version, about = "Aggregate AIP metadata from Archivematica storage services")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// SQLite database URL
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Root directory for fetch job staging directories
    #[arg(long, env = "AGGREGATOR_DOWNLOAD_ROOT", global = true)]
    download_root: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or update a storage service
    StorageServiceBootstrap {
        /// Unique name of the storage service
        #[arg(long)]
        name: String,

        /// Base URL, e.g. http://localhost:62081
        #[arg(long)]
        url: String,

        #[arg(long)]
        username: String,

        #[arg(long, env = "STORAGE_SERVICE_API_KEY", hide_env_values = true)]
        api_key: String,

        /// Packages requested per page
        #[arg(long, default_value_t = 20)]
        download_limit: i64,

        /// Offset of the first page
        #[arg(long, default_value_t = 0)]
        download_offset: i64,

        /// Make this the default storage service
        #[arg(long)]
        default: bool,

        /// Keep retrying the database connection
        #[arg(long)]
        wait: bool,

        /// Seconds to wait for the database with --wait
        #[arg(long, default_value_t = 60)]
        wait_timeout: u64,
    },

    /// Run one fetch cycle against a storage service
    Fetch {
        /// Storage service id, or "default"
        #[arg(long, default_value = admin::DEFAULT_SELECTOR)]
        storage_service: String,

        /// Concurrent METS workers
        #[arg(long, env = "AGGREGATOR_WORKER_CONCURRENCY")]
        workers: Option<usize>,

        /// Import only this page of the full package index
        #[arg(long, requires = "packages_per_page", value_parser = clap::value_parser!(u64).range(1..))]
        page: Option<u64>,

        /// Packages per page with --page
        #[arg(long, requires = "page", value_parser = clap::value_parser!(u64).range(1..))]
        packages_per_page: Option<u64>,

        /// Reuse the cached package index of an earlier session (YYYY-MM-DD-HH-MM-SS)
        #[arg(long, requires = "page")]
        session_id: Option<String>,
    },

    /// List fetch jobs, newest first
    ListFetchJobs {
        /// Only jobs of this storage service id
        #[arg(long)]
        storage_service: Option<i64>,
    },

    /// Delete a fetch job, its AIPs and its staging directory
    DeleteFetchJob {
        /// Fetch job id
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env().unwrap_or_else(|_| {
        LogConfig::builder()
            .log_file_prefix("aipscan-aggregator")
            .build()
    });
    if cli.verbose > 0 {
        log_config.level = LogLevel::from_verbosity(cli.verbose);
    }
    let _guard = init_logging(&log_config)?;

    let mut config = AggregatorConfig::load()?;
    if let Some(url) = cli.database_url {
        config.database.url = url;
    }
    if let Some(root) = cli.download_root {
        config.download_root = root;
    }

    match cli.command {
        Command::StorageServiceBootstrap {
            name,
            url,
            username,
            api_key,
            download_limit,
            download_offset,
            default,
            wait,
            wait_timeout,
        } => {
            let store = if wait {
                let pool = db::connect_with_wait(&config.database, Duration::from_secs(wait_timeout))
                    .await
                    .context("Database did not become available")?;
                Store::new(pool)
            } else {
                Store::open(&config.database).await?
            };

            let new = NewStorageService::new(name, url, username, api_key)
                .with_page(download_limit, download_offset)
                .as_default(default);
            let service = admin::bootstrap_storage_service(&store, &new).await?;
            println!("{}", service.id);
        },
        Command::Fetch {
            storage_service,
            workers,
            page,
            packages_per_page,
            session_id,
        } => {
            if let Some(workers) = workers {
                config = config.with_worker_concurrency(workers);
            }
            config.validate()?;

            let store = Store::open(&config.database).await?;
            let service = admin::resolve_storage_service(&store, &storage_service).await?;
            let coordinator = FetchCoordinator::new(store, config)?;

            let cancel = coordinator.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, stopping after the current page");
                    cancel.cancel();
                }
            });

            let selection = page.zip(packages_per_page).map(|(page, per_page)| {
                let selection = PageSelection::new(page, per_page);
                match session_id {
                    Some(session_id) => selection.with_session(session_id),
                    None => selection,
                }
            });

            info!(storage_service = %service.name, "Starting fetch");
            let report = match selection {
                Some(selection) => coordinator.run_page(service.id, &selection).await?,
                None => coordinator.run(service.id).await?,
            };
            println!("{}", report.summary());
        },
        Command::ListFetchJobs { storage_service } => {
            let store = Store::open(&config.database).await?;
            for job in store.list_fetch_jobs(storage_service).await? {
                let end = job
                    .download_end
                    .map(|end| end.to_string())
                    .unwrap_or_else(|| "incomplete".to_string());
                println!(
                    "{}\t{}\t{}\tpackages={} aips={} dips={} sips={} replicas={} deleted={}",
                    job.id,
                    job.download_start,
                    end,
                    count(job.total_packages),
                    count(job.total_aips),
                    count(job.total_dips),
                    count(job.total_sips),
                    count(job.total_replicas),
                    count(job.total_deleted_aips),
                );
            }
        },
        Command::DeleteFetchJob { id } => {
            let store = Store::open(&config.database).await?;
            let job = admin::delete_fetch_job(&store, &config.download_root, id).await?;
            info!(fetch_job_id = job.id, "Fetch job deleted");
        },
    }

    Ok(())
}

fn count(value: Option<i64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}
