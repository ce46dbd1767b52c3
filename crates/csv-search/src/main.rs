//! # csv-search CLI (`csvs`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `csvs init` | Create the SQLite database and its schema |
//! | `csvs ingest` | Load a CSV file into a dataset, embedding changed rows |
//! | `csvs search --query "<q>"` | Rank a dataset against a text query |
//! | `csvs get <id>` | Show one stored record and its derived entries |
//! | `csvs serve` | Start the HTTP search server |
//!
//! ## Examples
//!
//! ```bash
//! csvs --config ./config/csvs.toml init
//! csvs ingest --dataset items --csv data/items.csv --text-cols title,body
//! csvs search --query "red bicycle" --filter color=red --topk 5
//! csvs serve --bind 0.0.0.0:8080
//! ```
//!
//! Exit status is 0 on success, 2 for configuration errors and 1 for any
//! other failure.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use csv_search::config::{self, Config, LogFormat, LoggingConfig};
use csv_search::server::{self, ServeOptions};
use csv_search::service::{SearchQuery, Service};
use csv_search_core::ingest::IngestOptions;
use csv_search_core::search::Filter;
use csv_search_core::Error;

/// csv-search: semantic search over CSV datasets backed by SQLite.
#[derive(Parser)]
#[command(name = "csvs", version, about)]
struct Cli {
    /// Path to the configuration file (TOML).
    ///
    /// Defaults to `./config/csvs.toml` when that file exists.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path; overrides `[db].path`.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema. Safe to run repeatedly.
    Init,

    /// Ingest a CSV file into a dataset.
    ///
    /// Rows whose content is unchanged since the last run are skipped
    /// without calling the embedding model.
    Ingest {
        /// Dataset from `[datasets.*]` supplying defaults.
        #[arg(long)]
        dataset: Option<String>,
        /// Namespace to store rows under.
        #[arg(long)]
        table: Option<String>,
        /// Source CSV file.
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Rows per transaction batch.
        #[arg(long)]
        batch: Option<usize>,
        /// Identifier column.
        #[arg(long)]
        id_col: Option<String>,
        /// Comma-separated columns joined into the embedded text.
        #[arg(long)]
        text_cols: Option<String>,
        /// Comma-separated metadata columns; `*` keeps all.
        #[arg(long)]
        meta_cols: Option<String>,
        /// Latitude column (empty to disable).
        #[arg(long)]
        lat_col: Option<String>,
        /// Longitude column (empty to disable).
        #[arg(long)]
        lng_col: Option<String>,
    },

    /// Rank a dataset against a text query and print JSON results.
    Search {
        #[arg(long, short)]
        query: String,
        #[arg(long)]
        dataset: Option<String>,
        #[arg(long)]
        table: Option<String>,
        /// Number of results (defaults to `[search].default_top_k`).
        #[arg(long)]
        topk: Option<usize>,
        /// Exact-match metadata filter `field=value`; repeatable.
        #[arg(long = "filter")]
        filters: Vec<String>,
    },

    /// Print one stored record and which derived entries it has.
    Get {
        id: String,
        #[arg(long)]
        dataset: Option<String>,
        #[arg(long)]
        table: Option<String>,
    },

    /// Start the HTTP search server.
    Serve {
        /// Listen address (overrides `[server].bind`).
        #[arg(long)]
        bind: Option<String>,
        /// Default dataset for requests that name none.
        #[arg(long)]
        dataset: Option<String>,
        #[arg(long)]
        table: Option<String>,
        /// Default number of results.
        #[arg(long)]
        topk: Option<usize>,
        /// Per-request timeout in seconds.
        #[arg(long)]
        request_timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {:#}", err);
            exit_code(&err)
        }
    }
}

fn exit_code(err: &anyhow::Error) -> ExitCode {
    let is_config = err
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<Error>(), Some(Error::Configuration(_))));
    if is_config {
        ExitCode::from(2)
    } else {
        ExitCode::FAILURE
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("csv_search=info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match logging.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut cfg: Config = config::load_or_default(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        cfg.db.path = std::env::current_dir()?.join(db);
    }
    init_tracing(&cfg.logging);

    match cli.command {
        Commands::Init => {
            let service = Service::open(&cfg).await?;
            service.store().close().await;
            println!("Database initialized at {}", cfg.db_path().display());
        }
        Commands::Ingest {
            dataset,
            table,
            csv,
            batch,
            id_col,
            text_cols,
            meta_cols,
            lat_col,
            lng_col,
        } => {
            let selection = cfg.select_dataset(dataset.as_deref(), table.as_deref());
            let csv = match csv {
                Some(path) => path,
                None => selection
                    .config
                    .csv
                    .as_deref()
                    .map(|p| cfg.resolve_path(p))
                    .ok_or_else(|| {
                        Error::configuration("no CSV file given; pass --csv or set datasets.<name>.csv")
                    })?,
            };

            let mut columns = selection.config.columns();
            if let Some(id) = id_col {
                columns.id = id;
            }
            if let Some(text) = text_cols {
                columns.text = split_list(&text);
            }
            if let Some(meta) = meta_cols {
                columns.metadata = split_list(&meta);
            }
            if let Some(lat) = lat_col {
                columns.lat = Some(lat);
            }
            if let Some(lng) = lng_col {
                columns.lng = Some(lng);
            }
            let opts = IngestOptions::new(&selection.namespace, columns)
                .with_batch_size(batch.unwrap_or_else(|| selection.config.batch_size()));

            let service = Service::open(&cfg).await?;
            tokio::select! {
                result = service.ingest(&opts, &csv) => {
                    let summary = result.map_err(|failure| {
                        anyhow::Error::new(failure.error).context(format!(
                            "ingest of {} stopped after {} committed row(s)",
                            csv.display(),
                            failure.committed
                        ))
                    })?;
                    print_json(&summary)?;
                }
                _ = tokio::signal::ctrl_c() => {
                    bail!("ingest interrupted; the open batch was rolled back");
                }
            }
            service.store().close().await;
        }
        Commands::Search {
            query,
            dataset,
            table,
            topk,
            filters,
        } => {
            let filters = filters
                .iter()
                .map(|raw| Filter::parse(raw))
                .collect::<Result<Vec<_>, _>>()?;
            let query = SearchQuery {
                namespace: cfg
                    .select_dataset(dataset.as_deref(), table.as_deref())
                    .namespace,
                text: query,
                top_k: topk.filter(|k| *k > 0).unwrap_or(cfg.search.default_top_k),
                filters,
            };
            let service = Service::open(&cfg).await?;
            let hits = service.search(&query, None).await?;
            print_json(&hits)?;
        }
        Commands::Get { id, dataset, table } => {
            let namespace = cfg
                .select_dataset(dataset.as_deref(), table.as_deref())
                .namespace;
            let service = Service::open(&cfg).await?;
            let view = service
                .get(&namespace, &id)
                .await?
                .with_context(|| format!("record {:?} not found in dataset {:?}", id, namespace))?;
            print_json(&view)?;
        }
        Commands::Serve {
            bind,
            dataset,
            table,
            topk,
            request_timeout,
        } => {
            let mut options = ServeOptions::from_config(&cfg);
            if let Some(bind) = bind {
                options.bind = bind;
            }
            if dataset.is_some() || table.is_some() {
                options.namespace = cfg
                    .select_dataset(dataset.as_deref(), table.as_deref())
                    .namespace;
            }
            if let Some(k) = topk.filter(|k| *k > 0) {
                options.top_k = k;
            }
            if let Some(secs) = request_timeout.filter(|s| *s > 0) {
                options.request_timeout = Duration::from_secs(secs);
            }
            let service = Service::open(&cfg).await?;
            server::run_server(service.clone(), options).await?;
            service.store().close().await;
        }
    }
    Ok(())
}
