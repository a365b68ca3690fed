mod server;

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use chrono::DateTime;
use clap::{Parser, Subcommand, ValueEnum};
use dotenvy::dotenv;
use nanoid::nanoid;
use partner_gateway::{
    AccessLevel, ActivityLogger, AggregatorSettings, ApiKeyVerifier, DailySchedule, Environment,
    PosthogClient, ProxyRoute, ProxyRouteConfig, ReverseProxyForwarder, SqliteStore,
    TenantBatchAggregator, TenantConfig, WebhookNotifier, WriteQueue, aggregator, init_tracing,
    insights, schedule, spawn_analytics_schedule,
};
use reqwest::Url;
use tokio::sync::watch;
use tracing::{info, warn};

/// Upper bound for finishing background work after the server stops.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const NOTIFIER_NAME: &str = "Analytics Cron";

#[derive(Debug, Parser)]
#[command(author, version, about = "Partner API gateway with daily tenant analytics")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the gateway: proxy routes, activity log and the analytics schedule.
    Serve(ServeArgs),
    /// Register a new API key and print its secret once.
    CreateKey(CreateKeyArgs),
    /// Deactivate an API key, or reactivate it with `--enable`.
    DisableKey(DisableKeyArgs),
    /// Add or update a tenant's analytics project.
    AddTenant(AddTenantArgs),
    /// Print the latest stored analytics for a tenant.
    ShowAnalytics(ShowAnalyticsArgs),
}

#[derive(Debug, Parser)]
struct ServeArgs {
    /// Address to bind the gateway to.
    #[arg(long, env = "BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Port to bind the gateway to.
    #[arg(long, env = "PORT", default_value_t = 9427)]
    port: u16,

    /// SQLite database path for tenants, analytics, activity logs and keys.
    #[arg(long, env = "GATEWAY_DB_PATH", default_value = "partner_gateway.db")]
    db_path: String,

    /// Deployment environment (production, staging, development, local).
    #[arg(long, env = "ENVIRONMENT", default_value = "local")]
    environment: String,

    /// JSON file holding the proxy route list.
    #[arg(long, env = "PROXY_ROUTES_FILE")]
    proxy_routes: Option<PathBuf>,

    /// Seconds to wait for upstream response headers.
    #[arg(long, env = "PROXY_TIMEOUT_SECS", default_value_t = 10)]
    proxy_timeout_secs: u64,

    /// PostHog API base URL.
    #[arg(long, env = "POSTHOG_API_URL", default_value = insights::DEFAULT_POSTHOG_URL)]
    posthog_url: String,

    /// Per-request timeout for PostHog calls, in seconds.
    #[arg(long, env = "POSTHOG_TIMEOUT_SECS", default_value_t = 120)]
    posthog_timeout_secs: u64,

    /// Timezone used inside day-of-week/hour breakdowns.
    #[arg(long, env = "POSTHOG_TZ", default_value = aggregator::DEFAULT_PROJECT_TZ)]
    project_tz: String,

    /// Discord webhook receiving run notifications.
    #[arg(long, env = "DISCORD_WEBHOOK_URL", hide_env_values = true)]
    webhook_url: Option<Url>,

    /// Hour of day (0-23) for the daily analytics run.
    #[arg(long, env = "ANALYTICS_HOUR", default_value_t = schedule::DEFAULT_SCHEDULE_HOUR)]
    schedule_hour: u32,

    /// UTC offset, in hours, the schedule hour is expressed in.
    #[arg(
        long,
        env = "ANALYTICS_UTC_OFFSET",
        default_value_t = schedule::DEFAULT_UTC_OFFSET_HOURS,
        allow_negative_numbers = true
    )]
    schedule_utc_offset: i32,

    /// Length of the reporting window in days.
    #[arg(long, env = "ANALYTICS_WINDOW_DAYS", default_value_t = aggregator::DEFAULT_WINDOW_DAYS)]
    analytics_window_days: u32,

    /// Tenants processed concurrently per run.
    #[arg(long, env = "ANALYTICS_CONCURRENCY", default_value_t = aggregator::DEFAULT_CONCURRENCY)]
    analytics_concurrency: usize,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KeyLevel {
    Private,
    Public,
}

impl From<KeyLevel> for AccessLevel {
    fn from(level: KeyLevel) -> Self {
        match level {
            KeyLevel::Private => AccessLevel::Private,
            KeyLevel::Public => AccessLevel::Public,
        }
    }
}

#[derive(Debug, Parser)]
struct CreateKeyArgs {
    #[arg(long, env = "GATEWAY_DB_PATH", default_value = "partner_gateway.db")]
    db_path: String,

    /// Access level granted by the key.
    #[arg(long, value_enum, default_value_t = KeyLevel::Private)]
    level: KeyLevel,
}

#[derive(Debug, Parser)]
struct DisableKeyArgs {
    #[arg(long, env = "GATEWAY_DB_PATH", default_value = "partner_gateway.db")]
    db_path: String,

    /// Key id printed by `create-key`.
    id: String,

    /// Reactivate the key instead.
    #[arg(long)]
    enable: bool,
}

#[derive(Debug, Parser)]
struct ShowAnalyticsArgs {
    #[arg(long, env = "GATEWAY_DB_PATH", default_value = "partner_gateway.db")]
    db_path: String,

    tenant_id: String,
}

#[derive(Debug, Parser)]
struct AddTenantArgs {
    #[arg(long, env = "GATEWAY_DB_PATH", default_value = "partner_gateway.db")]
    db_path: String,

    #[arg(long)]
    tenant_id: String,

    /// PostHog project id.
    #[arg(long)]
    project_id: String,

    /// PostHog personal API key for the project.
    #[arg(long, env = "POSTHOG_PROJECT_KEY", hide_env_values = true)]
    project_key: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve(args) => run_server(args).await,
        Command::CreateKey(args) => {
            let store = SqliteStore::open(&args.db_path).await?;
            let secret = nanoid!(32);
            let id = store.insert_api_key(&secret, args.level.into()).await?;
            println!("id: {id}");
            println!("secret: {secret}");
            Ok(())
        }
        Command::AddTenant(args) => {
            let store = SqliteStore::open(&args.db_path).await?;
            store
                .save_tenant(&TenantConfig {
                    tenant_id: args.tenant_id,
                    project_id: args.project_id,
                    project_key: args.project_key,
                })
                .await?;
            Ok(())
        }
        Command::DisableKey(args) => {
            let store = SqliteStore::open(&args.db_path).await?;
            if !store.set_api_key_active(&args.id, args.enable).await? {
                return Err(format!("no api key with id {}", args.id).into());
            }
            info!(id = %args.id, active = args.enable, "api key updated");
            Ok(())
        }
        Command::ShowAnalytics(args) => {
            let store = SqliteStore::open(&args.db_path).await?;
            let Some(stored) = store.fetch_analytics(&args.tenant_id).await? else {
                return Err(format!("no analytics stored for tenant {}", args.tenant_id).into());
            };
            let updated_at = DateTime::from_timestamp(stored.updated_at, 0)
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| stored.updated_at.to_string());
            println!("updated_at: {updated_at}");
            println!("params: {}", serde_json::to_string_pretty(&stored.params)?);
            println!("analytics: {}", serde_json::to_string_pretty(&stored.analytics)?);
            Ok(())
        }
    }
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = SqliteStore::open(&args.db_path).await?;
    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;

    let routes = match args.proxy_routes.as_deref() {
        Some(path) => ProxyRouteConfig::load_file(path)?
            .into_iter()
            .map(ProxyRoute::try_from)
            .collect::<Result<Vec<_>, _>>()?,
        None => {
            warn!("no proxy routes configured");
            Vec::new()
        }
    };
    let forwarder = ReverseProxyForwarder::new(Duration::from_secs(args.proxy_timeout_secs))?;
    let verifier: Arc<dyn ApiKeyVerifier> = Arc::new(store.api_key_verifier(AccessLevel::Private));

    let queue = WriteQueue::start();
    let activity = ActivityLogger::new(
        queue.handle(),
        Arc::new(store.clone()),
        Environment::detect(&args.environment),
    );
    let router = server::build_router(routes, forwarder, Some(verifier), Some(activity))?;

    let provider = PosthogClient::new(
        &args.posthog_url,
        Duration::from_secs(args.posthog_timeout_secs),
    )?;
    if args.webhook_url.is_none() {
        warn!("DISCORD_WEBHOOK_URL not set; run notifications will be dropped");
    }
    let notifier = WebhookNotifier::new(args.webhook_url, NOTIFIER_NAME);
    let settings = AggregatorSettings {
        concurrency: args.analytics_concurrency,
        window_days: args.analytics_window_days,
        project_tz: args.project_tz,
        filter_test_accounts: !args.environment.eq_ignore_ascii_case("development"),
    };
    let aggregator = TenantBatchAggregator::new(
        Arc::new(store.clone()),
        Arc::new(provider),
        Arc::new(store.clone()),
        Arc::new(notifier),
        settings,
    );
    let schedule = DailySchedule::new(args.schedule_hour, args.schedule_utc_offset)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scheduler = spawn_analytics_schedule(aggregator, schedule, shutdown_rx);

    let served = server::serve(addr, router).await;

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(SHUTDOWN_GRACE, &mut scheduler).await.is_err() {
        warn!("analytics run still in progress at shutdown; aborting it");
        scheduler.abort();
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, queue.shutdown()).await.is_err() {
        warn!("write queue did not drain within {SHUTDOWN_GRACE:?}; pending writes dropped");
    }
    info!("partner gateway stopped");

    served?;
    Ok(())
}
