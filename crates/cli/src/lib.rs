use anyhow::{Context as AnyhowContext, Result};
use arabica_feed::{
    FeedCache, FeedConfig, XrpcProfileFetcher, DEFAULT_APPVIEW, DEFAULT_FEED_LIMIT,
};
use arabica_index::{RecordIndex, SqliteIndex};
use arabica_indexer::{
    BackfillConfig, BackfillOrchestrator, BackoffConfig, ConsumerConfig, FirehoseConsumer,
    JetstreamTransport, RegisteredIdentities, XrpcRepoLister, DEFAULT_JETSTREAM_ENDPOINT,
    DEFAULT_PLC_DIRECTORY,
};
use arabica_protocol::{unix_ms_now, Collection, Did};
use arabica_search::{SuggestionEngine, DEFAULT_SUGGESTION_LIMIT};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use serde::Serialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

mod metrics;

use metrics::MetricsExporter;

#[derive(Parser)]
#[command(name = "arabica-indexer")]
#[command(about = "Coffee activity indexer for the ATProto firehose", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite index file
    #[arg(long, global = true, env = "ARABICA_DB_PATH", default_value = "arabica.db")]
    db_path: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Tail the firehose and keep the index current until Ctrl-C
    Run(RunArgs),
    /// Backfill identities from their repositories and exit
    Backfill(BackfillArgs),
    /// Print typeahead suggestions as JSON
    Search(SearchArgs),
    /// Print the public feed as JSON
    Feed(FeedArgs),
    /// Print index statistics as JSON
    Stats,
    /// Remove all records of an identity
    Purge(PurgeArgs),
}

#[derive(Args)]
struct RepoArgs {
    /// PLC directory used to resolve did:plc identities
    #[arg(long, env = "ARABICA_PLC_URL", default_value = DEFAULT_PLC_DIRECTORY)]
    plc_url: String,

    /// Records requested per listRecords page
    #[arg(long, env = "ARABICA_PAGE_SIZE", default_value_t = 100)]
    page_size: u32,

    /// Timeout for each HTTP request
    #[arg(long, env = "ARABICA_HTTP_TIMEOUT_SECS", default_value_t = 20)]
    http_timeout_secs: u64,

    /// Stop paging a collection after this many pages
    #[arg(long, env = "ARABICA_MAX_PAGES", default_value_t = 100)]
    max_pages: usize,
}

#[derive(Args)]
struct RunArgs {
    /// Jetstream subscribe endpoint
    #[arg(long, env = "ARABICA_JETSTREAM_URL", default_value = DEFAULT_JETSTREAM_ENDPOINT)]
    jetstream_url: String,

    /// Identities to index even before any record of theirs has been seen
    #[arg(long = "registered", env = "ARABICA_REGISTERED", value_delimiter = ',')]
    registered: Vec<String>,

    /// Serve Prometheus metrics on this address, e.g. 127.0.0.1:9464
    #[arg(long, env = "ARABICA_METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Skip the startup backfill of known and registered identities
    #[arg(long)]
    no_startup_backfill: bool,

    /// Delay before the startup backfill begins
    #[arg(long, env = "ARABICA_STARTUP_DELAY_SECS", default_value_t = 5)]
    startup_delay_secs: u64,

    /// Save the stream cursor after this many events
    #[arg(long, env = "ARABICA_CURSOR_FLUSH_EVENTS", default_value_t = 100)]
    cursor_flush_events: usize,

    /// Save the stream cursor at least this often
    #[arg(long, env = "ARABICA_CURSOR_FLUSH_SECS", default_value_t = 5)]
    cursor_flush_secs: u64,

    #[arg(long, env = "ARABICA_CONNECT_TIMEOUT_SECS", default_value_t = 15)]
    connect_timeout_secs: u64,

    #[arg(long, env = "ARABICA_BACKOFF_INITIAL_MS", default_value_t = 1_000)]
    backoff_initial_ms: u64,

    #[arg(long, env = "ARABICA_BACKOFF_MAX_MS", default_value_t = 60_000)]
    backoff_max_ms: u64,

    /// How often gauges are refreshed and expired profiles pruned
    #[arg(long, env = "ARABICA_GAUGE_INTERVAL_SECS", default_value_t = 15)]
    gauge_interval_secs: u64,

    #[command(flatten)]
    repo: RepoArgs,
}

#[derive(Args)]
struct BackfillArgs {
    /// Identities to backfill
    #[arg(required = true)]
    dids: Vec<String>,

    #[command(flatten)]
    repo: RepoArgs,
}

#[derive(Args)]
struct SearchArgs {
    /// bean, roaster, grinder or brewer (short name or full NSID)
    collection: String,

    query: String,

    #[arg(long, default_value_t = DEFAULT_SUGGESTION_LIMIT)]
    limit: usize,
}

#[derive(Args)]
struct FeedArgs {
    /// Items to print; 0 applies the default page size
    #[arg(long, env = "ARABICA_FEED_LIMIT", default_value_t = DEFAULT_FEED_LIMIT)]
    limit: usize,

    /// Fetch missing author profiles from this AppView
    #[arg(long, env = "ARABICA_APPVIEW_URL")]
    appview: Option<String>,

    /// Do not fetch profiles; use only the local profile cache
    #[arg(long, conflicts_with = "appview")]
    offline: bool,
}

#[derive(Args)]
struct PurgeArgs {
    did: String,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    let mut stdout = io::stdout().lock();
    if let Err(err) = stdout
        .write_all(text.as_bytes())
        .and_then(|()| stdout.write_all(b"\n"))
        .and_then(|()| stdout.flush())
    {
        if err.kind() == io::ErrorKind::BrokenPipe {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

fn parse_dids(raw: &[String]) -> Result<Vec<Did>> {
    raw.iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| Did::parse(s).with_context(|| format!("Invalid DID '{s}'")))
        .collect()
}

fn open_index(path: &Path) -> Result<Arc<SqliteIndex>> {
    let index = SqliteIndex::open(path)
        .with_context(|| format!("Failed to open index at {}", path.display()))?;
    Ok(Arc::new(index))
}

fn backfill_orchestrator(
    index: Arc<dyn RecordIndex>,
    repo: &RepoArgs,
    startup_delay: Duration,
) -> Result<BackfillOrchestrator> {
    let lister = XrpcRepoLister::new(
        &repo.plc_url,
        repo.page_size,
        Duration::from_secs(repo.http_timeout_secs),
    )
    .context("Failed to build repository client")?;
    Ok(BackfillOrchestrator::new(
        index,
        Arc::new(lister),
        BackfillConfig {
            max_pages_per_collection: repo.max_pages,
            startup_delay,
        },
    ))
}

pub async fn main_entry() -> Result<()> {
    let cli = Cli::parse();

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    // tungstenite logs every frame at debug.
    if !cli.verbose {
        builder.filter_module("tungstenite", log::LevelFilter::Warn);
        builder.filter_module("tokio_tungstenite", log::LevelFilter::Warn);
    }
    builder.target(env_logger::Target::Stderr).init();

    match cli.command {
        Commands::Run(args) => run(&cli.db_path, args).await?,
        Commands::Backfill(args) => run_backfill(&cli.db_path, args).await?,
        Commands::Search(args) => run_search(&cli.db_path, args).await?,
        Commands::Feed(args) => run_feed(&cli.db_path, args).await?,
        Commands::Stats => print_json(&open_index(&cli.db_path)?.stats().await?)?,
        Commands::Purge(args) => run_purge(&cli.db_path, args).await?,
    }

    Ok(())
}

async fn run(db_path: &Path, args: RunArgs) -> Result<()> {
    let index = open_index(db_path)?;
    let registry = Arc::new(RegisteredIdentities::new(parse_dids(&args.registered)?));
    let transport = JetstreamTransport::new(&args.jetstream_url, Collection::ALL)
        .context("Invalid Jetstream endpoint")?;

    let consumer = FirehoseConsumer::new(
        index.clone(),
        Arc::new(transport),
        registry.clone(),
        ConsumerConfig {
            cursor_flush_events: args.cursor_flush_events,
            cursor_flush_interval: Duration::from_secs(args.cursor_flush_secs),
            connect_timeout: Duration::from_secs(args.connect_timeout_secs),
            backoff: BackoffConfig {
                initial: Duration::from_millis(args.backoff_initial_ms),
                max: Duration::from_millis(args.backoff_max_ms),
                ..BackoffConfig::default()
            },
        },
    );

    let shutdown = CancellationToken::new();
    consumer.start(&shutdown)?;
    info!("Firehose consumer started ({})", args.jetstream_url);

    let startup_backfill = if args.no_startup_backfill {
        None
    } else {
        let backfill = backfill_orchestrator(
            index.clone(),
            &args.repo,
            Duration::from_secs(args.startup_delay_secs),
        )?;
        Some(backfill.spawn_startup_backfill(registry, shutdown.child_token()))
    };

    let exporter = MetricsExporter::new()?;
    let metrics_server = match &args.metrics_addr {
        Some(addr) => Some(exporter.serve(addr)?),
        None => None,
    };
    let housekeeping = spawn_housekeeping(
        exporter,
        index.clone(),
        consumer.clone(),
        Duration::from_secs(args.gauge_interval_secs.max(1)),
        shutdown.clone(),
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    shutdown.cancel();
    consumer.stop().await;
    if let Some(handle) = startup_backfill {
        join_logged("startup backfill", handle).await;
    }
    join_logged("housekeeping", housekeeping).await;
    if let Some(server) = metrics_server {
        server.abort();
    }
    Ok(())
}

/// Wait for a background task, logging a panic or abort instead of dropping it.
async fn join_logged<T>(name: &str, handle: JoinHandle<T>) -> Option<T> {
    match handle.await {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("{name} task ended abnormally: {err}");
            None
        }
    }
}

/// Periodically refresh gauges and drop expired profile cache rows.
fn spawn_housekeeping(
    exporter: MetricsExporter,
    index: Arc<SqliteIndex>,
    consumer: FirehoseConsumer,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            exporter.set_connected(consumer.is_connected());
            match index.stats().await {
                Ok(stats) => exporter.update(&stats),
                Err(err) => warn!("Failed to read index stats: {err}"),
            }
            match index.prune_profiles(unix_ms_now()).await {
                Ok(0) => {}
                Ok(pruned) => info!("Pruned {pruned} expired profiles"),
                Err(err) => warn!("Failed to prune profiles: {err}"),
            }
        }
    })
}

async fn run_backfill(db_path: &Path, args: BackfillArgs) -> Result<()> {
    let index = open_index(db_path)?;
    let dids = parse_dids(&args.dids)?;
    let backfill = backfill_orchestrator(index, &args.repo, Duration::ZERO)?;
    let summary = backfill.backfill_all(dids, &CancellationToken::new()).await;
    print_json(&summary)
}

async fn run_search(db_path: &Path, args: SearchArgs) -> Result<()> {
    let collection = Collection::parse(&args.collection)?;
    let engine = SuggestionEngine::new(open_index(db_path)?);
    let suggestions = engine.search(collection, &args.query, args.limit).await?;
    print_json(&suggestions)
}

async fn run_feed(db_path: &Path, args: FeedArgs) -> Result<()> {
    let config = FeedConfig {
        limit: args.limit,
        ..FeedConfig::default()
    };
    let mut feed = FeedCache::new(open_index(db_path)?, config);
    if !args.offline {
        let appview = args.appview.as_deref().unwrap_or(DEFAULT_APPVIEW);
        let fetcher = XrpcProfileFetcher::new(appview, Duration::from_secs(10))?;
        feed = feed.with_profile_fetcher(Arc::new(fetcher));
    }
    let items = feed.get_feed().await?;
    print_json(&*items)
}

async fn run_purge(db_path: &Path, args: PurgeArgs) -> Result<()> {
    let did = Did::parse(&args.did).with_context(|| format!("Invalid DID '{}'", args.did))?;
    let removed = open_index(db_path)?.purge_identity(&did).await?;
    info!("Purged {removed} records of {did}");
    print_json(&serde_json::json!({ "did": did, "removed": removed }))
}
