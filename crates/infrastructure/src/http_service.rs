//! HTTP服务适配器
//!
//! 把一个外部HTTP端点包装成 [`MediaService`]：
//! `POST {"item": ..., "attempt": n}`，响应 `{"items": [...]}`。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use orchestrator_config::HttpServiceConfig;
use orchestrator_domain::{JobType, MediaItem, MediaService, ServiceContext, ServiceRole};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};

#[derive(Serialize)]
struct ServiceRequest<'a> {
    item: Option<&'a MediaItem>,
    attempt: u32,
}

#[derive(Deserialize)]
struct ServiceResponse {
    #[serde(default)]
    items: Vec<MediaItem>,
}

pub struct HttpMediaService {
    key: String,
    role: ServiceRole,
    job_type: Option<JobType>,
    url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpMediaService {
    pub fn new(
        key: impl Into<String>,
        role: ServiceRole,
        job_type: Option<JobType>,
        url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            key: key.into(),
            role,
            job_type,
            url: url.into(),
            timeout,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &HttpServiceConfig) -> anyhow::Result<Self> {
        Ok(Self::new(
            config.key.clone(),
            config.role,
            config.job_type()?,
            config.url.clone(),
            Duration::from_secs(config.timeout_seconds),
        ))
    }

    fn classify_status(&self, status: StatusCode, item_id: Option<i64>, body: &str) -> OrchestratorError {
        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => OrchestratorError::StaleData {
                id: item_id.unwrap_or_default(),
            },
            _ => OrchestratorError::service(
                &self.key,
                format!("HTTP请求失败，状态码: {}, 响应: {}", status.as_u16(), body),
            ),
        }
    }
}

#[async_trait]
impl MediaService for HttpMediaService {
    fn key(&self) -> &str {
        &self.key
    }

    fn job_type(&self) -> Option<JobType> {
        self.job_type
    }

    fn role(&self) -> ServiceRole {
        self.role
    }

    async fn run(
        &self,
        item: Option<MediaItem>,
        ctx: &ServiceContext,
    ) -> OrchestratorResult<Vec<MediaItem>> {
        ctx.ensure_not_cancelled()?;
        let start_time = Instant::now();
        let item_id = item.as_ref().map(MediaItem::id);

        info!(
            "调用HTTP服务: service={}, item_id={:?}, attempt={}",
            self.key, item_id, ctx.attempt
        );

        let request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&ServiceRequest {
                item: item.as_ref(),
                attempt: ctx.attempt,
            })
            .send();

        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            response = request => response.map_err(|e| {
                error!("HTTP服务调用失败: service={}, error={}", self.key, e);
                if e.is_timeout() {
                    OrchestratorError::ExecutionTimeout
                } else {
                    OrchestratorError::Network(format!("{}: {e}", self.key))
                }
            })?,
        };

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| OrchestratorError::Network(format!("读取响应体失败: {e}")))?;

        if !status.is_success() {
            return Err(self.classify_status(status, item_id, &body));
        }

        let parsed: ServiceResponse = serde_json::from_str(&body)
            .map_err(|e| OrchestratorError::invalid_result(&self.key, format!("响应体无法解析: {e}")))?;

        debug!(
            "HTTP服务调用完成: service={}, items={}, duration={}ms",
            self.key,
            parsed.items.len(),
            start_time.elapsed().as_millis()
        );
        Ok(parsed.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Json, http::StatusCode as AxumStatus, routing::post, Router};
    use orchestrator_domain::{ItemFacts, Movie};
    use serde_json::{json, Value};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn movie() -> MediaItem {
        MediaItem::Movie(Movie {
            facts: ItemFacts::new(8),
        })
    }

    fn service(url: String) -> HttpMediaService {
        HttpMediaService::new(
            "scraper",
            ServiceRole::Processor,
            Some(JobType::Scrape),
            url,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_returns_items_from_response() {
        let base = serve(Router::new().route(
            "/run",
            post(|Json(body): Json<Value>| async move {
                let mut item = body["item"].clone();
                item["facts"]["title"] = json!("Dune");
                Json(json!({ "items": [item] }))
            }),
        ))
        .await;

        let items = service(format!("{base}/run"))
            .run(Some(movie()), &ServiceContext::default())
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].facts().unwrap().title.as_deref(), Some("Dune"));
    }

    #[tokio::test]
    async fn test_status_classification() {
        let base = serve(
            Router::new()
                .route("/gone", post(|| async { AxumStatus::GONE }))
                .route("/down", post(|| async { AxumStatus::SERVICE_UNAVAILABLE }))
                .route("/garbage", post(|| async { "not json" })),
        )
        .await;
        let ctx = ServiceContext::default();

        let gone = service(format!("{base}/gone")).run(Some(movie()), &ctx).await;
        assert!(matches!(gone, Err(OrchestratorError::StaleData { id: 8 })));

        let down = service(format!("{base}/down")).run(Some(movie()), &ctx).await;
        assert!(down.unwrap_err().is_retryable());

        let garbage = service(format!("{base}/garbage")).run(Some(movie()), &ctx).await;
        assert!(matches!(garbage, Err(OrchestratorError::InvalidResult { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let ctx = ServiceContext::default();
        ctx.cancel.cancel();
        let result = service("http://127.0.0.1:9/run".to_string())
            .run(Some(movie()), &ctx)
            .await;
        assert!(matches!(result, Err(OrchestratorError::Cancelled)));
    }
}
