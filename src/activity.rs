//! Per-request activity log, persisted through the write queue.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Instant};

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts, MatchedPath, Path, State},
    http::{Method, Request, header::CONTENT_LENGTH, header::USER_AGENT},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use nanoid::nanoid;
use serde::Serialize;

use crate::store::StoreError;
use crate::write_queue::WriteQueueHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Prod,
    Stage,
    Local,
}

impl Environment {
    pub fn detect(raw: &str) -> Self {
        let env = raw.trim().to_ascii_lowercase();
        if env.starts_with("prod") {
            Environment::Prod
        } else if env.starts_with("stag") || env.starts_with("development") {
            Environment::Stage
        } else {
            Environment::Local
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Prod => "prod",
            Environment::Stage => "stage",
            Environment::Local => "local",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResponseOutcome {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERROR")]
    Error,
}

impl ResponseOutcome {
    pub fn from_status(status: u16) -> Self {
        if status < 400 {
            ResponseOutcome::Ok
        } else {
            ResponseOutcome::Error
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseOutcome::Ok => "OK",
            ResponseOutcome::Error => "ERROR",
        }
    }
}

/// 一次请求的活动日志。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityLogRecord {
    pub id: String,
    pub environment: Environment,
    pub method: String,
    pub route: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub query_params: Option<String>,
    pub route_params: Option<String>,
    pub status_code: u16,
    pub response: ResponseOutcome,
    pub response_time: String,
    pub response_size: Option<String>,
    pub created_at: i64,
}

/// Durable sink for activity records. Only ever called from the write queue.
#[async_trait]
pub trait ActivityLogStore: Send + Sync {
    async fn create(&self, record: &ActivityLogRecord) -> Result<(), StoreError>;
}

/// State for [`record_activity`].
#[derive(Clone)]
pub struct ActivityLogger {
    queue: WriteQueueHandle,
    store: Arc<dyn ActivityLogStore>,
    environment: Environment,
}

impl ActivityLogger {
    pub fn new(
        queue: WriteQueueHandle,
        store: Arc<dyn ActivityLogStore>,
        environment: Environment,
    ) -> Self {
        Self {
            queue,
            store,
            environment,
        }
    }

    fn submit(&self, record: ActivityLogRecord) {
        let store = self.store.clone();
        let context = format!("activity log {} {}", record.method, record.route);
        self.queue
            .enqueue(async move { store.create(&record).await }, Some(&context));
    }
}

struct RequestSnapshot {
    method: Method,
    route: String,
    ip_address: Option<String>,
    user_agent: Option<String>,
    query_params: Option<String>,
    route_params: Option<String>,
}

impl RequestSnapshot {
    async fn capture(request: Request<Body>) -> (Self, Request<Body>) {
        let (mut parts, body) = request.into_parts();

        let route = parts
            .extensions
            .get::<MatchedPath>()
            .map(|matched| matched.as_str().to_owned())
            .unwrap_or_else(|| parts.uri.path().to_owned());
        let route_params = Path::<HashMap<String, String>>::from_request_parts(&mut parts, &())
            .await
            .ok()
            .filter(|Path(params)| !params.is_empty())
            .and_then(|Path(params)| serde_json::to_string(&params).ok());
        let query_params = parts.uri.query().map(|query| {
            let pairs: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect();
            serde_json::to_string(&pairs).unwrap_or_else(|_| query.to_owned())
        });

        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        };
        let ip_address = header("x-real-ip")
            .or_else(|| {
                header("x-forwarded-for")
                    .and_then(|raw| raw.split(',').next().map(|ip| ip.trim().to_owned()))
            })
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            });
        let user_agent = header(USER_AGENT.as_str());

        let snapshot = Self {
            method: parts.method.clone(),
            route,
            ip_address,
            user_agent,
            query_params,
            route_params,
        };
        (snapshot, Request::from_parts(parts, body))
    }

    fn finish(
        self,
        environment: Environment,
        response: &Response,
        started: Instant,
    ) -> ActivityLogRecord {
        let status_code = response.status().as_u16();
        let response_size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|raw| raw.parse::<u64>().ok())
            .filter(|size| *size > 0)
            .map(format_bytes);

        ActivityLogRecord {
            id: nanoid!(15),
            environment,
            method: self.method.to_string(),
            route: self.route,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            query_params: self.query_params,
            route_params: self.route_params,
            status_code,
            response: ResponseOutcome::from_status(status_code),
            response_time: format_duration(started.elapsed().as_secs_f64() * 1000.0),
            response_size,
            created_at: Utc::now().timestamp(),
        }
    }
}

/// axum middleware: records every non-`OPTIONS` request once its response is
/// ready and hands the record to the write queue.
pub async fn record_activity(
    State(logger): State<ActivityLogger>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    let started = Instant::now();
    let (snapshot, request) = RequestSnapshot::capture(request).await;
    let response = next.run(request).await;
    logger.submit(snapshot.finish(logger.environment, &response, started));
    response
}

/// Human readable duration, e.g. `1m 2.50s` or `0.25s`.
pub fn format_duration(ms: f64) -> String {
    let ms = ms.abs();
    let days = (ms / 86_400_000.0).floor() as u64;
    let hours = (ms / 3_600_000.0).floor() as u64 % 24;
    let minutes = (ms / 60_000.0).floor() as u64 % 60;
    let secs = (ms / 1000.0) % 60.0;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    if secs >= 0.005 || parts.is_empty() {
        parts.push(format!("{secs:.2}s"));
    }
    parts.join(" ")
}

/// Human readable size with 1024 steps, e.g. `1.5 KB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["Bytes", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 Bytes".to_owned();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = (value * 100.0).round() / 100.0;
    format!("{rounded} {}", UNITS[unit])
}
