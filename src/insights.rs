//! Insight queries against the product analytics provider and the helpers
//! that reshape their breakdown results.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// PostHog cloud 默认地址。
pub const DEFAULT_POSTHOG_URL: &str = "https://us.posthog.com";

/// Blocking refreshes can take a while on large projects.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(120);

/// Inclusive, day-granular reporting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(rename = "date_from")]
    pub from: NaiveDate,
    #[serde(rename = "date_to")]
    pub to: NaiveDate,
}

impl DateRange {
    /// Window of `days` days that ends yesterday relative to `today`.
    ///
    /// Provider data lags by a day, so the newest complete day is always the
    /// one before the run.
    pub fn ending_yesterday(today: NaiveDate, days: u32) -> Self {
        let to = today.pred_opt().unwrap_or(today);
        let span = u64::from(days.max(1) - 1);
        let from = to.checked_sub_days(Days::new(span)).unwrap_or(to);
        Self { from, to }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueryKind {
    TrendsQuery,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSeries {
    kind: &'static str,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub math: Option<String>,
}

impl EventSeries {
    pub fn new(event: &str) -> Self {
        Self {
            kind: "EventsNode",
            event: event.to_owned(),
            math: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrendsFilter {
    pub display: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakdownFilter {
    pub breakdown: String,
    pub breakdown_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakdown_limit: Option<u32>,
}

impl BreakdownFilter {
    /// Breakdown on an event property.
    pub fn event(property: &str) -> Self {
        Self {
            breakdown: property.to_owned(),
            breakdown_type: "event".to_owned(),
            breakdown_limit: None,
        }
    }

    /// Breakdown on a HogQL expression.
    pub fn hogql(expression: String) -> Self {
        Self {
            breakdown: expression,
            breakdown_type: "hogql".to_owned(),
            breakdown_limit: None,
        }
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.breakdown_limit = Some(limit);
        self
    }
}

/// Description of one analytics query, serialized as the provider's
/// `TrendsQuery` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    pub kind: QueryKind,
    pub date_range: DateRange,
    pub series: Vec<EventSeries>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trends_filter: Option<TrendsFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakdown_filter: Option<BreakdownFilter>,
    pub filter_test_accounts: bool,
}

impl QuerySpec {
    pub fn trends(date_range: DateRange, events: &[&str]) -> Self {
        Self {
            kind: QueryKind::TrendsQuery,
            date_range,
            series: events.iter().map(|event| EventSeries::new(event)).collect(),
            interval: None,
            trends_filter: None,
            breakdown_filter: None,
            filter_test_accounts: true,
        }
    }

    /// Applies the same aggregation (`total`, `dau`, ...) to every series.
    pub fn math(mut self, math: &str) -> Self {
        for series in &mut self.series {
            series.math = Some(math.to_owned());
        }
        self
    }

    /// Totals-only table display.
    pub fn table(mut self) -> Self {
        self.trends_filter = Some(TrendsFilter {
            display: "ActionsTable".to_owned(),
        });
        self
    }

    pub fn interval(mut self, interval: &str) -> Self {
        self.interval = Some(interval.to_owned());
        self
    }

    pub fn breakdown(mut self, breakdown: BreakdownFilter) -> Self {
        self.breakdown_filter = Some(breakdown);
        self
    }

    pub fn filter_test_accounts(mut self, enabled: bool) -> Self {
        self.filter_test_accounts = enabled;
        self
    }
}

/// Opaque id handed out by the provider when a query is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct InsightHandle(pub i64);

/// Computed insight. Only the row list is interpreted; every other field is
/// carried through untouched so the stored document keeps the provider shape.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InsightResponse {
    #[serde(default)]
    pub result: Option<Vec<InsightRow>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InsightRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<SeriesAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SeriesAction {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InsightRow {
    fn action_name(&self) -> Option<&str> {
        self.action.as_ref().and_then(|action| action.name.as_deref())
    }

    fn series_name(&self) -> Option<&str> {
        self.action_name().or(self.label.as_deref())
    }
}

/// Picks the first row whose action name (or label, when the row has no
/// action name) equals `event`, as a single-row response.
pub fn split_by_event_name(response: &InsightResponse, event: &str) -> Option<InsightResponse> {
    let row = response
        .result
        .as_ref()?
        .iter()
        .find(|row| row.series_name() == Some(event))?;
    Some(InsightResponse {
        result: Some(vec![row.clone()]),
        extra: response.extra.clone(),
    })
}

/// Keeps every row whose action name equals `event`. Used for breakdown
/// queries where one event yields a row per entity.
pub fn filter_by_event_name(response: &InsightResponse, event: &str) -> Option<InsightResponse> {
    let rows: Vec<InsightRow> = response
        .result
        .as_ref()?
        .iter()
        .filter(|row| row.action_name() == Some(event))
        .cloned()
        .collect();
    if rows.is_empty() {
        return None;
    }
    Some(InsightResponse {
        result: Some(rows),
        extra: response.extra.clone(),
    })
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid provider endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider answered {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("provider did not return an insight id")]
    MissingHandle,
    #[error("{0}")]
    Provider(String),
}

/// Normalized outcome of one query: the provider data, an explicit
/// "nothing matched", or the failure that prevented an answer.
#[derive(Debug, Clone)]
pub enum QueryResult {
    Ready(InsightResponse),
    NoData,
    Failed(Arc<QueryError>),
}

impl QueryResult {
    pub fn data(&self) -> Option<&InsightResponse> {
        match self {
            QueryResult::Ready(response) => Some(response),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&QueryError> {
        match self {
            QueryResult::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Derives a new result from the data, keeping failures as they are.
    pub fn reshape<F>(&self, f: F) -> QueryResult
    where
        F: FnOnce(&InsightResponse) -> Option<InsightResponse>,
    {
        match self {
            QueryResult::Ready(response) => {
                f(response).map_or(QueryResult::NoData, QueryResult::Ready)
            }
            QueryResult::NoData => QueryResult::NoData,
            QueryResult::Failed(err) => QueryResult::Failed(err.clone()),
        }
    }
}

/// Two-phase analytics provider: submit a query, then poll its handle.
#[async_trait]
pub trait QueryProvider: Send + Sync {
    async fn submit_query(
        &self,
        spec: &QuerySpec,
        project_id: &str,
        api_key: &str,
    ) -> Result<InsightHandle, QueryError>;

    /// Blocks server-side until the insight is computed.
    async fn poll_result(
        &self,
        handle: InsightHandle,
        project_id: &str,
        api_key: &str,
    ) -> Result<InsightResponse, QueryError>;
}

/// Submits `spec` and polls the returned handle. Never collapses into one call.
pub async fn execute_query(
    provider: &dyn QueryProvider,
    spec: &QuerySpec,
    project_id: &str,
    api_key: &str,
) -> QueryResult {
    let handle = match provider.submit_query(spec, project_id, api_key).await {
        Ok(handle) => handle,
        Err(err) => return QueryResult::Failed(Arc::new(err)),
    };

    match provider.poll_result(handle, project_id, api_key).await {
        Ok(response) => QueryResult::Ready(response),
        Err(err) => QueryResult::Failed(Arc::new(err)),
    }
}

/// reqwest-backed client for the PostHog insights API.
#[derive(Clone, Debug)]
pub struct PosthogClient {
    client: Client,
    base: Url,
}

#[derive(Serialize)]
struct SubmitBody<'a> {
    query: &'a QuerySpec,
}

#[derive(Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    id: Option<InsightHandle>,
}

impl PosthogClient {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, QueryError> {
        let mut base = Url::parse(base)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base })
    }

    fn insights_url(&self, project_id: &str, suffix: &str) -> Result<Url, QueryError> {
        let path = format!(
            "api/projects/{}/insights/{}",
            urlencoding::encode(project_id),
            suffix
        );
        Ok(self.base.join(&path)?)
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, QueryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(QueryError::Status { status, body })
}

#[async_trait]
impl QueryProvider for PosthogClient {
    async fn submit_query(
        &self,
        spec: &QuerySpec,
        project_id: &str,
        api_key: &str,
    ) -> Result<InsightHandle, QueryError> {
        let url = self.insights_url(project_id, "")?;
        let response = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .json(&SubmitBody { query: spec })
            .send()
            .await?;
        let created: SubmitResponse = ensure_success(response).await?.json().await?;
        created.id.ok_or(QueryError::MissingHandle)
    }

    async fn poll_result(
        &self,
        handle: InsightHandle,
        project_id: &str,
        api_key: &str,
    ) -> Result<InsightResponse, QueryError> {
        let url = self.insights_url(project_id, &format!("{}/", handle.0))?;
        let response = self
            .client
            .get(url)
            .query(&[("refresh", "blocking")])
            .bearer_auth(api_key)
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::{
        Json, Router,
        extract::{Path, Query},
        http::HeaderMap,
        routing::{get, post},
    };
    use serde_json::json;

    use super::*;

    fn response(rows: Value) -> InsightResponse {
        serde_json::from_value(json!({ "id": 7, "result": rows })).unwrap()
    }

    #[test]
    fn date_range_ends_yesterday() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let range = DateRange::ending_yesterday(today, 30);
        assert_eq!(range.to, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert_eq!(range.from, NaiveDate::from_ymd_opt(2024, 1, 31).unwrap());

        let single = DateRange::ending_yesterday(today, 1);
        assert_eq!(single.from, single.to);
    }

    #[test]
    fn date_range_serializes_with_provider_keys() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let value = serde_json::to_value(DateRange::ending_yesterday(today, 7)).unwrap();
        assert_eq!(value, json!({ "date_from": "2024-03-03", "date_to": "2024-03-09" }));
    }

    #[test]
    fn query_spec_serializes_as_trends_query() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let spec = QuerySpec::trends(DateRange::ending_yesterday(today, 7), &["$pageview"])
            .math("dau")
            .table()
            .breakdown(BreakdownFilter::event("$pathname").limit(50))
            .filter_test_accounts(false);

        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["kind"], "TrendsQuery");
        assert_eq!(
            value["series"][0],
            json!({ "kind": "EventsNode", "event": "$pageview", "math": "dau" })
        );
        assert_eq!(value["trendsFilter"]["display"], "ActionsTable");
        assert_eq!(value["breakdownFilter"]["breakdown_type"], "event");
        assert_eq!(value["breakdownFilter"]["breakdown_limit"], 50);
        assert_eq!(value["filterTestAccounts"], false);
        assert!(value.get("interval").is_none());
    }

    #[test]
    fn split_returns_single_matching_row() {
        let res = response(json!([
            { "action": { "name": "A" }, "aggregated_value": 3 },
            { "action": { "name": "B" }, "aggregated_value": 5 },
        ]));

        let split = split_by_event_name(&res, "B").unwrap();
        let rows = split.result.as_ref().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], res.result.as_ref().unwrap()[1]);
        assert_eq!(split.extra.get("id"), Some(&json!(7)));

        assert!(split_by_event_name(&res, "C").is_none());
    }

    #[test]
    fn split_falls_back_to_label() {
        let res = response(json!([
            { "label": "doctor-page-booking", "count": 2 },
            { "action": { "name": null }, "label": "other" },
        ]));
        assert!(split_by_event_name(&res, "doctor-page-booking").is_some());
        assert!(split_by_event_name(&res, "other").is_some());
    }

    #[test]
    fn split_and_filter_handle_missing_rows() {
        let empty = InsightResponse::default();
        assert!(split_by_event_name(&empty, "A").is_none());
        assert!(filter_by_event_name(&empty, "A").is_none());
    }

    #[test]
    fn filter_keeps_every_matching_row() {
        let res = response(json!([
            { "action": { "name": "X" }, "breakdown_value": "Doe" },
            { "action": { "name": "Y" } },
        ]));

        let filtered = filter_by_event_name(&res, "X").unwrap();
        let rows = filtered.result.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].extra.get("breakdown_value"), Some(&json!("Doe")));

        let multi = response(json!([
            { "action": { "name": "X" }, "breakdown_value": "Doe" },
            { "action": { "name": "X" }, "breakdown_value": "Roe" },
            { "action": { "name": "Y" }, "breakdown_value": "Doe" },
        ]));
        assert_eq!(filter_by_event_name(&multi, "X").unwrap().result.unwrap().len(), 2);
        assert!(filter_by_event_name(&multi, "Z").is_none());
    }

    #[test]
    fn reshape_preserves_failures() {
        let failed = QueryResult::Failed(Arc::new(QueryError::MissingHandle));
        assert!(failed.reshape(|r| Some(r.clone())).error().is_some());

        let ready = QueryResult::Ready(response(json!([{ "action": { "name": "A" } }])));
        assert!(matches!(ready.reshape(|r| split_by_event_name(r, "B")), QueryResult::NoData));
        assert!(ready.reshape(|r| split_by_event_name(r, "A")).data().is_some());
    }

    #[derive(Default)]
    struct ScriptedProvider {
        fail_submit: bool,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl QueryProvider for ScriptedProvider {
        async fn submit_query(
            &self,
            _spec: &QuerySpec,
            project_id: &str,
            _api_key: &str,
        ) -> Result<InsightHandle, QueryError> {
            self.calls.lock().unwrap().push(format!("submit:{project_id}"));
            if self.fail_submit {
                return Err(QueryError::Provider("rejected".into()));
            }
            Ok(InsightHandle(11))
        }

        async fn poll_result(
            &self,
            handle: InsightHandle,
            project_id: &str,
            _api_key: &str,
        ) -> Result<InsightResponse, QueryError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("poll:{project_id}:{}", handle.0));
            Ok(InsightResponse::default())
        }
    }

    fn sample_spec() -> QuerySpec {
        let today = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        QuerySpec::trends(DateRange::ending_yesterday(today, 7), &["$pageview"])
    }

    #[tokio::test]
    async fn execute_query_submits_then_polls() {
        let provider = ScriptedProvider::default();
        let result = execute_query(&provider, &sample_spec(), "p1", "key").await;
        assert!(result.data().is_some());
        assert_eq!(
            *provider.calls.lock().unwrap(),
            vec!["submit:p1".to_string(), "poll:p1:11".to_string()]
        );
    }

    #[tokio::test]
    async fn execute_query_skips_poll_when_submit_fails() {
        let provider = ScriptedProvider {
            fail_submit: true,
            ..Default::default()
        };
        let result = execute_query(&provider, &sample_spec(), "p1", "key").await;
        assert!(result.error().is_some());
        assert_eq!(provider.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn posthog_client_speaks_insights_api() {
        async fn create(
            Path(project): Path<String>,
            headers: HeaderMap,
            Json(body): Json<Value>,
        ) -> Json<Value> {
            assert_eq!(project, "42");
            assert_eq!(headers.get("authorization").unwrap(), "Bearer phx_key");
            assert_eq!(body["query"]["kind"], "TrendsQuery");
            Json(json!({ "id": 99 }))
        }

        async fn fetch(
            Path((project, id)): Path<(String, i64)>,
            Query(query): Query<std::collections::HashMap<String, String>>,
        ) -> Json<Value> {
            assert_eq!(project, "42");
            assert_eq!(id, 99);
            assert_eq!(query.get("refresh").map(String::as_str), Some("blocking"));
            Json(json!({ "id": 99, "result": [{ "action": { "name": "A" }, "count": 4 }] }))
        }

        let app = Router::new()
            .route("/api/projects/:project/insights/", post(create))
            .route("/api/projects/:project/insights/:id/", get(fetch));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = PosthogClient::new(&format!("http://{addr}"), Duration::from_secs(5)).unwrap();
        let result = execute_query(&client, &sample_spec(), "42", "phx_key").await;
        let data = result.data().expect("insight data");
        assert_eq!(data.result.as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn posthog_client_reports_error_status() {
        let app = Router::new().route(
            "/api/projects/:project/insights/",
            post(|| async { (StatusCode::UNAUTHORIZED, "bad key") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client =
            PosthogClient::new(&format!("http://{addr}/"), Duration::from_secs(5)).unwrap();
        let err = client
            .submit_query(&sample_spec(), "42", "nope")
            .await
            .unwrap_err();
        match err {
            QueryError::Status { status, body } => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert_eq!(body, "bad key");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
