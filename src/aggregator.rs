//! Daily per-tenant analytics aggregation.
//!
//! Every run lists the configured tenants, runs the query bundle for at most
//! `concurrency` tenants at a time, persists one merged document per tenant and
//! reports the outcome through the notification channel. A failing tenant never
//! affects its siblings.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use futures_util::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{error, info, warn};

use crate::insights::{
    BreakdownFilter, DateRange, InsightResponse, QueryProvider, QueryResult, QuerySpec,
    execute_query, filter_by_event_name, split_by_event_name,
};
use crate::notify::{
    COLOR_FAILURE, COLOR_INFO, COLOR_SUCCESS, COLOR_WARNING, Embed, Notifier, spawn_notification,
};

pub const DEFAULT_CONCURRENCY: usize = 2;
pub const DEFAULT_WINDOW_DAYS: u32 = 30;
pub const DEFAULT_PROJECT_TZ: &str = "Asia/Manila";

const REPORTED_TENANTS: usize = 22;
const ERROR_PREVIEW_CHARS: usize = 100;

const TITLE_STARTED: &str = "Analytics Cron Job Started";
const TITLE_FAILED: &str = "Analytics Cron Job Failed";
const TITLE_FINISHED: &str = "Analytics Cron Job Finished";

const EVENT_VIEW_PROFILE: &str = "doctor-directory-view-profile";
const EVENT_SEARCH: &str = "doctor-directory-search";
const EVENT_FILTERS_APPLIED: &str = "doctor-directory-filters-applied";
const EVENT_BOOKING_LINK: &str = "doctor-directory-booking-link";
const EVENT_PAGE_BOOKING: &str = "doctor-page-booking";
const EVENT_PAGEVIEW: &str = "$pageview";

/// Analytics project a tenant reports into.
#[derive(Clone, PartialEq, Eq)]
pub struct TenantConfig {
    pub tenant_id: String,
    pub project_id: String,
    pub project_key: String,
}

impl std::fmt::Debug for TenantConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantConfig")
            .field("tenant_id", &self.tenant_id)
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("tenant directory query failed: {0}")]
    Query(String),
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("metrics serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("metrics upsert failed: {0}")]
    Upsert(String),
}

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn list(&self) -> Result<Vec<TenantConfig>, DirectoryError>;
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Insert-or-replace keyed by tenant id. Last write wins.
    async fn upsert(
        &self,
        tenant_id: &str,
        metrics: &TenantAnalyticsRecord,
        params: &DateRange,
    ) -> Result<(), PersistError>;
}

/// Merged per-tenant metrics document, keyed the way the dashboard reads it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantAnalyticsRecord {
    pub dau_res: Option<InsightResponse>,
    pub referrers_res: Option<InsightResponse>,
    pub doctor_views_res: Option<InsightResponse>,
    pub searches_res: Option<InsightResponse>,
    pub filters_applied_res: Option<InsightResponse>,
    pub dir_booking_link_res: Option<InsightResponse>,
    pub page_booking_res: Option<InsightResponse>,
    pub top_searches_res: Option<InsightResponse>,
    pub top_filters_res: Option<InsightResponse>,
    pub doctor_profile_views_by_doctor_res: Option<InsightResponse>,
    pub dir_booking_clicks_by_doctor_res: Option<InsightResponse>,
    pub page_bookings_by_doctor_res: Option<InsightResponse>,
    pub page_views_by_path_res: Option<InsightResponse>,
    pub page_views_by_day_and_hour_res: Option<InsightResponse>,
    pub unique_users_by_day_and_hour_res: Option<InsightResponse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Success => f.write_str("success"),
            RunStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Outcome for one tenant. The status is derived from `error`, so a failed
/// result always carries its message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub tenant_id: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunResult {
    pub fn succeeded(tenant_id: String, duration_ms: u64) -> Self {
        Self {
            tenant_id,
            duration_ms,
            error: None,
        }
    }

    pub fn failed(tenant_id: String, duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            tenant_id,
            duration_ms,
            error: Some(error.into()),
        }
    }

    pub fn status(&self) -> RunStatus {
        if self.error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Success
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Completion order, not submission order.
    pub results: Vec<RunResult>,
}

impl RunSummary {
    pub fn from_results(results: Vec<RunResult>) -> Self {
        let failed = results
            .iter()
            .filter(|result| result.status() == RunStatus::Failed)
            .count();
        Self {
            total: results.len(),
            succeeded: results.len() - failed,
            failed,
            results,
        }
    }
}

/// Knobs that shape one aggregation run.
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub concurrency: usize,
    pub window_days: u32,
    pub project_tz: String,
    pub filter_test_accounts: bool,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            window_days: DEFAULT_WINDOW_DAYS,
            project_tz: DEFAULT_PROJECT_TZ.to_owned(),
            filter_test_accounts: true,
        }
    }
}

/// The fixed set of provider queries issued for every tenant.
///
/// Single-event KPIs and the per-doctor tables are bundled into multi-series
/// queries and split back apart afterwards.
#[derive(Debug, Clone)]
struct QueryBundle {
    kpi_totals: QuerySpec,
    by_doctor: QuerySpec,
    daily_active_users: QuerySpec,
    referrers: QuerySpec,
    top_searches: QuerySpec,
    top_filters: QuerySpec,
    page_views_by_path: QuerySpec,
    page_views_by_day_and_hour: QuerySpec,
    unique_users_by_day_and_hour: QuerySpec,
}

impl QueryBundle {
    fn build(range: DateRange, settings: &AggregatorSettings) -> Self {
        let filter = settings.filter_test_accounts;
        let trends =
            |events: &[&str]| QuerySpec::trends(range, events).filter_test_accounts(filter);
        let day_and_hour = || {
            let tz = &settings.project_tz;
            BreakdownFilter::hogql(format!(
                "tuple(modulo(toDayOfWeek(toTimeZone(timestamp, '{tz}')), 7), toHour(toTimeZone(timestamp, '{tz}')))"
            ))
            .limit(1000)
        };

        Self {
            kpi_totals: trends(&[
                EVENT_VIEW_PROFILE,
                EVENT_SEARCH,
                EVENT_FILTERS_APPLIED,
                EVENT_BOOKING_LINK,
                EVENT_PAGE_BOOKING,
            ])
            .table(),
            by_doctor: trends(&[EVENT_VIEW_PROFILE, EVENT_BOOKING_LINK, EVENT_PAGE_BOOKING])
                .table()
                .breakdown(BreakdownFilter::event("doctorName").limit(1000)),
            daily_active_users: trends(&[EVENT_PAGEVIEW])
                .math("dau")
                .interval("day")
                .breakdown(BreakdownFilter::event("$device_type")),
            referrers: trends(&[EVENT_PAGEVIEW])
                .table()
                .breakdown(BreakdownFilter::event("$referring_domain")),
            top_searches: trends(&[EVENT_SEARCH])
                .table()
                .breakdown(BreakdownFilter::event("query")),
            top_filters: trends(&[EVENT_FILTERS_APPLIED])
                .table()
                .breakdown(BreakdownFilter::event("specializations")),
            page_views_by_path: trends(&[EVENT_PAGEVIEW])
                .table()
                .breakdown(BreakdownFilter::event("$pathname")),
            page_views_by_day_and_hour: trends(&[EVENT_PAGEVIEW])
                .math("total")
                .table()
                .breakdown(day_and_hour()),
            unique_users_by_day_and_hour: trends(&[EVENT_PAGEVIEW])
                .math("dau")
                .table()
                .breakdown(day_and_hour()),
        }
    }
}

/// Collects per-metric failures while assembling a record.
struct MetricCollector<'a> {
    tenant_id: &'a str,
    failures: usize,
}

impl MetricCollector<'_> {
    fn take(&mut self, metric: &str, result: QueryResult) -> Option<InsightResponse> {
        match result {
            QueryResult::Ready(response) => Some(response),
            QueryResult::NoData => None,
            QueryResult::Failed(err) => {
                self.failures += 1;
                warn!(tenant_id = self.tenant_id, metric, error = %err, "analytics query failed");
                None
            }
        }
    }
}

/// Aggregates analytics for every configured tenant.
#[derive(Clone)]
pub struct TenantBatchAggregator {
    directory: Arc<dyn TenantDirectory>,
    provider: Arc<dyn QueryProvider>,
    store: Arc<dyn MetricsStore>,
    notifier: Arc<dyn Notifier>,
    settings: AggregatorSettings,
}

impl TenantBatchAggregator {
    pub fn new(
        directory: Arc<dyn TenantDirectory>,
        provider: Arc<dyn QueryProvider>,
        store: Arc<dyn MetricsStore>,
        notifier: Arc<dyn Notifier>,
        settings: AggregatorSettings,
    ) -> Self {
        Self {
            directory,
            provider,
            store,
            notifier,
            settings,
        }
    }

    /// Reporting window for a run happening on `today`.
    pub fn date_range_for(&self, today: NaiveDate) -> DateRange {
        DateRange::ending_yesterday(today, self.settings.window_days)
    }

    /// Runs one full aggregation pass over the tenant directory.
    pub async fn run_batch(&self, range: DateRange) -> RunSummary {
        let started = Instant::now();
        self.notify(Embed::new(
            TITLE_STARTED,
            "Starting to fetch daily hospital analytics data.",
            COLOR_INFO,
        ));

        let tenants = match self.directory.list().await {
            Ok(tenants) => tenants,
            Err(err) => {
                error!(error = %err, "failed to fetch tenant configurations");
                self.notify(
                    Embed::new(
                        TITLE_FAILED,
                        "Failed to fetch analytics configurations.",
                        COLOR_FAILURE,
                    )
                    .field("Error", err.to_string(), false),
                );
                return RunSummary::default();
            }
        };

        if tenants.is_empty() {
            info!("no tenant configurations to process");
            self.notify(Embed::new(
                TITLE_FINISHED,
                "No hospital configurations found to process.",
                COLOR_WARNING,
            ));
            return RunSummary::default();
        }

        info!(
            tenants = tenants.len(),
            from = %range.from,
            to = %range.to,
            "analytics run started"
        );

        let bundle = Arc::new(QueryBundle::build(range, &self.settings));
        let permits = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for tenant in tenants {
            let this = self.clone();
            let bundle = bundle.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return RunResult::failed(tenant.tenant_id, 0, "concurrency gate closed");
                };
                this.process_tenant_isolated(tenant, &bundle, range).await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => error!(error = %err, "tenant task did not complete"),
            }
        }

        let summary = RunSummary::from_results(results);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            elapsed_ms,
            "analytics run finished"
        );
        self.notify(finish_report(&summary, elapsed_ms));
        summary
    }

    fn notify(&self, embed: Embed) {
        spawn_notification(self.notifier.clone(), embed);
    }

    async fn process_tenant_isolated(
        &self,
        tenant: TenantConfig,
        bundle: &QueryBundle,
        range: DateRange,
    ) -> RunResult {
        let started = Instant::now();
        let tenant_id = tenant.tenant_id.clone();
        AssertUnwindSafe(self.process_tenant(tenant, bundle, range, started))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(tenant_id = %tenant_id, "tenant pipeline panicked");
                RunResult::failed(
                    tenant_id,
                    started.elapsed().as_millis() as u64,
                    "tenant pipeline panicked",
                )
            })
    }

    async fn process_tenant(
        &self,
        tenant: TenantConfig,
        bundle: &QueryBundle,
        range: DateRange,
        started: Instant,
    ) -> RunResult {
        let record = self.collect_metrics(&tenant, bundle).await;
        let persisted = self.store.upsert(&tenant.tenant_id, &record, &range).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match persisted {
            Ok(()) => RunResult::succeeded(tenant.tenant_id, duration_ms),
            Err(err) => {
                error!(tenant_id = %tenant.tenant_id, error = %err, "failed to persist analytics");
                RunResult::failed(tenant.tenant_id, duration_ms, err.to_string())
            }
        }
    }

    async fn collect_metrics(
        &self,
        tenant: &TenantConfig,
        bundle: &QueryBundle,
    ) -> TenantAnalyticsRecord {
        let (
            kpi_totals,
            by_doctor,
            daily_active_users,
            referrers,
            top_searches,
            top_filters,
            page_views_by_path,
            page_views_by_day_and_hour,
            unique_users_by_day_and_hour,
        ) = tokio::join!(
            self.query(tenant, &bundle.kpi_totals),
            self.query(tenant, &bundle.by_doctor),
            self.query(tenant, &bundle.daily_active_users),
            self.query(tenant, &bundle.referrers),
            self.query(tenant, &bundle.top_searches),
            self.query(tenant, &bundle.top_filters),
            self.query(tenant, &bundle.page_views_by_path),
            self.query(tenant, &bundle.page_views_by_day_and_hour),
            self.query(tenant, &bundle.unique_users_by_day_and_hour),
        );

        let split = |event: &str| kpi_totals.reshape(|res| split_by_event_name(res, event));
        let per_doctor = |event: &str| by_doctor.reshape(|res| filter_by_event_name(res, event));

        let mut collector = MetricCollector {
            tenant_id: &tenant.tenant_id,
            failures: 0,
        };
        let record = TenantAnalyticsRecord {
            dau_res: collector.take("dauRes", daily_active_users),
            referrers_res: collector.take("referrersRes", referrers),
            doctor_views_res: collector.take("doctorViewsRes", split(EVENT_VIEW_PROFILE)),
            searches_res: collector.take("searchesRes", split(EVENT_SEARCH)),
            filters_applied_res: collector.take("filtersAppliedRes", split(EVENT_FILTERS_APPLIED)),
            dir_booking_link_res: collector.take("dirBookingLinkRes", split(EVENT_BOOKING_LINK)),
            page_booking_res: collector.take("pageBookingRes", split(EVENT_PAGE_BOOKING)),
            top_searches_res: collector.take("topSearchesRes", top_searches),
            top_filters_res: collector.take("topFiltersRes", top_filters),
            doctor_profile_views_by_doctor_res: collector
                .take("doctorProfileViewsByDoctorRes", per_doctor(EVENT_VIEW_PROFILE)),
            dir_booking_clicks_by_doctor_res: collector
                .take("dirBookingClicksByDoctorRes", per_doctor(EVENT_BOOKING_LINK)),
            page_bookings_by_doctor_res: collector
                .take("pageBookingsByDoctorRes", per_doctor(EVENT_PAGE_BOOKING)),
            page_views_by_path_res: collector.take("pageViewsByPathRes", page_views_by_path),
            page_views_by_day_and_hour_res: collector
                .take("pageViewsByDayAndHourRes", page_views_by_day_and_hour),
            unique_users_by_day_and_hour_res: collector
                .take("uniqueUsersByDayAndHourRes", unique_users_by_day_and_hour),
        };

        if collector.failures > 0 {
            warn!(
                tenant_id = %tenant.tenant_id,
                failures = collector.failures,
                "analytics record is incomplete"
            );
        }
        record
    }

    async fn query(&self, tenant: &TenantConfig, spec: &QuerySpec) -> QueryResult {
        execute_query(
            self.provider.as_ref(),
            spec,
            &tenant.project_id,
            &tenant.project_key,
        )
        .await
    }
}

fn seconds(ms: u64) -> String {
    format!("{:.2}", ms as f64 / 1000.0)
}

/// End-of-run report: totals plus one line for each of the first 22 tenants.
pub fn finish_report(summary: &RunSummary, elapsed_ms: u64) -> Embed {
    let color = if summary.failed > 0 {
        COLOR_FAILURE
    } else {
        COLOR_SUCCESS
    };

    let mut embed = Embed::new(
        TITLE_FINISHED,
        format!("Job finished in {}s.", seconds(elapsed_ms)),
        color,
    )
    .field("Total Processed", summary.total.to_string(), true)
    .field("Succeeded", summary.succeeded.to_string(), true)
    .field("Failed", summary.failed.to_string(), true);

    for result in summary.results.iter().take(REPORTED_TENANTS) {
        let mut line = format!(
            "Status: {} | Duration: {}s",
            result.status(),
            seconds(result.duration_ms)
        );
        if let Some(error) = result.error.as_deref() {
            let preview: String = error.chars().take(ERROR_PREVIEW_CHARS).collect();
            line.push_str(&format!("\nError: ```{preview}```"));
        }
        embed = embed.field(format!("Tenant: {}", result.tenant_id), line, false);
    }
    embed
}
