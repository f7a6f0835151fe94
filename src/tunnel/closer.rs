use async_trait::async_trait;

use crate::app::{ClientInfoTracker, Engine};

/// 隧道持有的可释放子资源，按获取顺序登记、逆序释放
#[async_trait]
pub trait Closer: Send + Sync {
    fn name(&self) -> &str;

    async fn close(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl Closer for Engine {
    fn name(&self) -> &str {
        "engine"
    }

    async fn close(&self) -> anyhow::Result<()> {
        Engine::close(self).await?;
        Ok(())
    }
}

#[async_trait]
impl Closer for ClientInfoTracker {
    fn name(&self) -> &str {
        "client-tracker"
    }

    async fn close(&self) -> anyhow::Result<()> {
        let cleared = ClientInfoTracker::close(self).await;
        tracing::debug!(cleared, "client tracker closed");
        Ok(())
    }
}
