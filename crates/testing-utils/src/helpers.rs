//! 测试辅助：异步条件轮询与指标文本过滤

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::sleep;

const POLL_EVERY: Duration = Duration::from_millis(20);

pub struct TestEnv;

impl TestEnv {
    /// 每20ms检查一次条件，直到成立或超时；超时前最后再检查一次
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition().await {
                return true;
            }
            sleep(POLL_EVERY).await;
        }
        condition().await
    }

    /// 文本格式指标中属于某个指标名的样本行（带标签的那些）
    pub fn metric_lines(rendered: &str, name: &str) -> Vec<String> {
        let prefix = format!("{name}{{");
        rendered
            .lines()
            .filter(|line| line.starts_with(&prefix))
            .map(str::to_string)
            .collect()
    }
}
