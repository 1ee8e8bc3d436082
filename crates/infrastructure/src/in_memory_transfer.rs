use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use dataflow_core::SchedulerResult;
use dataflow_domain::{
    DataInstance, DataLocation, DataTransfer, TransferListener, TransferRequest,
};

/// 内存中的数据传输服务，记录每个位置上保存的数据版本
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransferService {
    latency: Duration,
    stored: Arc<RwLock<HashMap<DataLocation, DataInstance>>>,
}

impl InMemoryTransferService {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            stored: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn stored_at(&self, location: &DataLocation) -> Option<DataInstance> {
        self.stored.read().await.get(location).copied()
    }

    pub async fn transfer_count(&self) -> usize {
        self.stored.read().await.len()
    }
}

#[async_trait]
impl DataTransfer for InMemoryTransferService {
    async fn transfer(
        &self,
        request: TransferRequest,
        listener: TransferListener,
    ) -> SchedulerResult<()> {
        let Some(source) = request.source.clone() else {
            warn!("数据 {} 没有可用副本，无法传输", request.data);
            listener.failed(&request, format!("数据 {} 没有可用副本", request.data));
            return Ok(());
        };
        debug!("传输 {}: {} -> {}", request.data, source, request.target);

        let stored = self.stored.clone();
        let latency = self.latency;
        tokio::spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            stored
                .write()
                .await
                .insert(request.target.clone(), request.data);
            listener.completed(&request);
        });
        Ok(())
    }
}
