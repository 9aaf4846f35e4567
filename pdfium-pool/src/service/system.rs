use tracing::info;

use crate::bridge::{CallbackSet, unexpected};
use crate::error::PoolResult;
use crate::pool::PoolStats;
use crate::protocol::{NativeRequest, NativeResponse, OperationKind};
use crate::responses::TtfMapResponse;
use crate::worker::CallTarget;

use super::PdfiumService;

impl PdfiumService {
    /// Default charset to font mapping of the library. Needs no document, so
    /// it runs on whichever worker is least busy.
    pub async fn get_default_ttf_map(&self) -> PoolResult<TtfMapResponse> {
        let worker = self.pool.any_worker()?;
        match self
            .pool
            .execute(
                &worker,
                NativeRequest::GetDefaultTtfMap,
                CallTarget::stateless(),
                None,
                CallbackSet::none(),
            )
            .await?
        {
            NativeResponse::TtfMap { entries } => Ok(TtfMapResponse { entries }),
            other => Err(unexpected(OperationKind::GetDefaultTtfMap, &other)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Stop every worker. Outstanding handles become invalid.
    pub async fn shutdown(&self) {
        info!(forms = self.forms.len(), "Shutting down pdfium service");
        self.forms.clear();
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use crate::error::PoolError;
    use crate::requests::LoadDocument;
    use crate::service::tests::memory_service;

    #[tokio::test]
    async fn test_ttf_map_needs_no_document() {
        let service = memory_service(2).await;
        let map = service.get_default_ttf_map().await.unwrap();
        assert_eq!(map.entries[0].charset, 0);
        assert!(map.entries.iter().any(|e| e.font_name == "MS Gothic"));
        assert_eq!(service.stats().sessions, 0);
    }

    #[tokio::test]
    async fn test_no_work_after_shutdown() {
        let service = memory_service(1).await;
        service.shutdown().await;

        assert_eq!(
            service.get_default_ttf_map().await.unwrap_err(),
            PoolError::NoHealthyWorker
        );
        assert_eq!(
            service
                .load_document(LoadDocument::default())
                .await
                .unwrap_err(),
            PoolError::NoHealthyWorker
        );
    }
}
