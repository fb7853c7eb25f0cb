use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use jobwatch_adapters::{AreaDirectory, CityDirectory, HhAreaClient, ListingSource};
use jobwatch_core::{SearchRequest, UserId};
use jobwatch_storage::{
    HttpFetcher, ListingStore, MemoryListingStore, MemoryScheduleRepository, PgListingStore,
    PgScheduleRepository, ScheduleRepository,
};
use jobwatch_sync::{
    build_hh_source, AuthServiceClient, CredentialService, Dispatcher, IdentityService,
    LiveStreamRegistry, NotificationFanout, RelayBotChannel, SearchOrchestrator, SyncConfig,
};
use jobwatch_web::AppState;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobwatch-cli")]
#[command(about = "Job Watch: scheduled vacancy polling and notification")]
struct Cli {
    /// Keep listings and schedules in process memory instead of Postgres.
    #[arg(long, global = true)]
    in_memory: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Dispatcher, workers and web server until Ctrl-C.
    Run,
    Migrate,
    /// One dispatch tick, drained by the worker pool.
    Tick,
    /// Manual search for one user.
    Search {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        query: Option<String>,
        #[arg(long)]
        days: Option<u32>,
    },
}

struct Services {
    dispatcher: Arc<Dispatcher>,
    credentials: Arc<dyn CredentialService>,
    identity: Arc<dyn IdentityService>,
    streams: Arc<LiveStreamRegistry>,
    areas: Arc<dyn CityDirectory>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&config, cli.in_memory).await?,
        Commands::Migrate => {
            let pool = jobwatch_storage::connect(&config.database_url, 2).await?;
            jobwatch_storage::migrate(&pool).await?;
            println!("migrations applied");
        }
        Commands::Tick => {
            let services = build_services(&config, cli.in_memory).await?;
            let summary = services.dispatcher.run_once().await?;
            println!(
                "tick complete: due={} enqueued={} in_flight={} queue_full={}",
                summary.due, summary.enqueued, summary.already_in_flight, summary.queue_full
            );
        }
        Commands::Search { user, query, days } => {
            let services = build_services(&config, cli.in_memory).await?;
            let token = services
                .credentials
                .access_token(user)
                .await?
                .ok_or_else(|| anyhow!("no access token available for user {user}"))?;
            let request = SearchRequest {
                query,
                days,
                ..SearchRequest::default()
            };
            let run = services.dispatcher.search_now(&request, &token, user).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&run).context("serializing search result")?
            );
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("JOBWATCH_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

async fn build_services(config: &SyncConfig, in_memory: bool) -> Result<Services> {
    let fetcher = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let source: Arc<dyn ListingSource> = Arc::new(build_hh_source(fetcher.clone(), config)?);
    let areas: Arc<dyn CityDirectory> = Arc::new(AreaDirectory::new(HhAreaClient::new(
        fetcher.clone(),
        &config.source_base_url,
    )?));
    let auth = Arc::new(AuthServiceClient::new(fetcher, &config.auth_base_url)?);

    let (listings, schedules) = if in_memory {
        info!("using in-memory storage");
        let listings: Arc<dyn ListingStore> = Arc::new(MemoryListingStore::new());
        let schedules: Arc<dyn ScheduleRepository> = Arc::new(MemoryScheduleRepository::new());
        (listings, schedules)
    } else {
        let pool = jobwatch_storage::connect(&config.database_url, 10).await?;
        jobwatch_storage::migrate(&pool).await?;
        let listings: Arc<dyn ListingStore> = Arc::new(PgListingStore::new(pool.clone()));
        let schedules: Arc<dyn ScheduleRepository> = Arc::new(PgScheduleRepository::new(pool));
        (listings, schedules)
    };

    let streams = Arc::new(LiveStreamRegistry::new());
    let bot = Arc::new(RelayBotChannel::new(auth.clone()));
    let fanout = NotificationFanout::new(
        listings.clone(),
        bot.clone(),
        streams.clone(),
        config.max_items_per_message,
    );
    let orchestrator = Arc::new(SearchOrchestrator::new(
        source,
        listings,
        auth.clone(),
        fanout,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        schedules,
        auth.clone(),
        auth.clone(),
        bot,
        orchestrator,
        config.dispatch_config(),
    ));

    Ok(Services {
        dispatcher,
        credentials: auth.clone(),
        identity: auth,
        streams,
        areas,
    })
}

async fn run(config: &SyncConfig, in_memory: bool) -> Result<()> {
    let services = build_services(config, in_memory).await?;
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let dispatcher_task = tokio::spawn(services.dispatcher.clone().run(cancel_rx.clone()));
    let state = AppState {
        dispatcher: services.dispatcher,
        identity: services.identity,
        streams: services.streams,
        areas: services.areas,
        shutdown: cancel_rx,
    };
    let mut web_task = tokio::spawn(jobwatch_web::serve(state, config.web_port));

    let web_result = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut web_task => Some(result),
    };
    info!("shutdown requested; stopping dispatcher and web server");
    let _ = cancel_tx.send(true);

    let web_result = match web_result {
        Some(result) => result,
        None => web_task.await,
    };
    if let Err(err) = dispatcher_task.await {
        error!(error = %err, "dispatcher task ended abnormally");
    }
    web_result.context("web server task")??;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
}
