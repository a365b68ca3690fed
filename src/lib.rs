//! Partner integration gateway: a transparent reverse proxy for partner
//! APIs, a serialized activity log, and a daily multi-tenant analytics job.

pub mod activity;
pub mod aggregator;
pub mod auth;
pub mod forwarder;
pub mod insights;
pub mod notify;
pub mod schedule;
pub mod store;
pub mod write_queue;

use tracing_subscriber::EnvFilter;

pub use activity::{
    ActivityLogRecord, ActivityLogStore, ActivityLogger, Environment, record_activity,
};
pub use aggregator::{
    AggregatorSettings, MetricsStore, RunResult, RunStatus, RunSummary, TenantAnalyticsRecord,
    TenantBatchAggregator, TenantConfig, TenantDirectory,
};
pub use auth::{AccessLevel, ApiKeyVerifier, AuthRejection};
pub use forwarder::{
    ForwardError, ProxyRequestContext, ProxyRoute, ProxyRouteConfig, ReverseProxyForwarder,
    register_proxy_route, register_proxy_routes,
};
pub use insights::{DateRange, PosthogClient, QueryProvider, QueryResult, QuerySpec};
pub use notify::{Embed, Notifier, WebhookNotifier};
pub use schedule::{DailySchedule, ScheduleError, spawn_analytics_schedule};
pub use store::{SqliteStore, StoreError};
pub use write_queue::{WriteQueue, WriteQueueHandle};

/// Installs the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` filter. Safe to call more than once; later calls are no-ops.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
