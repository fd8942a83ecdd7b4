//! 把运行时指令分发到连接管理器

use async_trait::async_trait;

use super::{FlagHandler, FlagName, FlagRequest};
use crate::connection::ConnectionManager;

#[async_trait]
impl FlagHandler for ConnectionManager {
    async fn handle(&self, flag: FlagName, request: &FlagRequest) -> anyhow::Result<()> {
        match flag {
            FlagName::FetchGroups => {
                let groups = self.request_discovery().await?;
                tracing::info!(groups, requested_at = %request.requested_at, "Discovery request handled");
            }
            FlagName::RefreshQr => {
                let outcome = self.request_qr_refresh().await?;
                tracing::info!(?outcome, requested_at = %request.requested_at, "QR refresh request handled");
            }
            FlagName::Disconnect => {
                let outcome = self.request_disconnect().await?;
                tracing::info!(?outcome, requested_at = %request.requested_at, "Disconnect request handled");
            }
        }
        Ok(())
    }
}
