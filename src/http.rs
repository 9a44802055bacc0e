//! 运维HTTP端点：`/metrics` 输出文本格式指标，`/health` 报告运行模式与队列概况

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use orchestrator_dispatcher::EventManager;
use orchestrator_infrastructure::MetricsRegistry;
use orchestrator_worker::QueueMonitor;
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::broadcast};
use tracing::info;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Clone)]
pub struct HttpState {
    pub mode: String,
    pub metrics: Arc<MetricsRegistry>,
    pub monitor: Option<Arc<QueueMonitor>>,
    pub events: Option<Arc<EventManager>>,
}

impl HttpState {
    pub fn new(mode: impl Into<String>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            mode: mode.into(),
            metrics,
            monitor: None,
            events: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<QueueMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_events(mut self, events: Arc<EventManager>) -> Self {
        self.events = Some(events);
        self
    }
}

pub fn create_routes(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

async fn render_metrics(State(state): State<HttpState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.metrics.render(),
    )
}

async fn health_check(State(state): State<HttpState>) -> Json<Value> {
    let mut body = json!({
        "status": "ok",
        "mode": state.mode,
        "version": env!("CARGO_PKG_VERSION"),
    });

    if let Some(monitor) = &state.monitor {
        let jobs: BTreeMap<&'static str, usize> = monitor
            .counts()
            .await
            .into_iter()
            .map(|(job_state, count)| (job_state.as_str(), count))
            .collect();
        body["jobs"] = json!(jobs);
    }
    if let Some(events) = &state.events {
        body["events"] = json!({
            "queued": events.queued_count().await,
            "running": events.running_ids().await.len(),
        });
    }

    Json(body)
}

/// 在给定地址上提供端点，收到关闭信号后停止接受新连接
pub async fn serve(
    bind_address: &str,
    state: HttpState,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("绑定HTTP地址失败: {bind_address}"))?;
    serve_on(listener, state, async move {
        let _ = shutdown_rx.recv().await;
    })
    .await
}

pub async fn serve_on<F>(listener: TcpListener, state: HttpState, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let address = listener.local_addr().context("读取监听地址失败")?;
    info!("HTTP端点已启动: http://{address}");

    axum::serve(listener, create_routes(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP服务运行失败")?;

    info!("HTTP端点已停止");
    Ok(())
}
