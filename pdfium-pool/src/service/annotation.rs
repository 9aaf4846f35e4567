use crate::bridge::CallbackSet;
use crate::error::PoolResult;
use crate::handle::HandleKind;
use crate::protocol::{NativeRequest, OperationKind};
use crate::requests::{CloseAnnotation, CreateAnnotation, GetAnnotationCount, RemoveAnnotation};
use crate::responses::{AnnotationCountResponse, AnnotationResponse};

use super::{PdfiumService, count, created, done};

impl PdfiumService {
    pub async fn get_annotation_count(
        &self,
        request: GetAnnotationCount,
    ) -> PoolResult<AnnotationCountResponse> {
        let (page, target) = self.resolve_page(&request.page, None)?;
        let response = self
            .run(
                &target,
                NativeRequest::GetAnnotationCount { page },
                CallbackSet::none(),
            )
            .await?;
        Ok(AnnotationCountResponse {
            count: count(OperationKind::GetAnnotationCount, response)?,
        })
    }

    pub async fn create_annotation(
        &self,
        request: CreateAnnotation,
    ) -> PoolResult<AnnotationResponse> {
        let (page, target) = self.resolve_page(&request.page, None)?;
        let response = self
            .run(
                &target,
                NativeRequest::CreateAnnotation {
                    page,
                    subtype: request.subtype,
                },
                CallbackSet::none(),
            )
            .await?;
        let native = created(OperationKind::CreateAnnotation, response)?;
        let annotation = self
            .adopt(
                &target,
                native,
                HandleKind::Annotation,
                NativeRequest::CloseAnnotation { annotation: native },
            )
            .await?;
        Ok(AnnotationResponse { annotation })
    }

    /// Release the annotation handle. The annotation stays on its page.
    pub async fn close_annotation(&self, request: CloseAnnotation) -> PoolResult<()> {
        let (annotation, target) =
            self.resolve(request.annotation, HandleKind::Annotation, None)?;
        self.pool.registry().invalidate(request.annotation);
        let response = self
            .run(
                &target,
                NativeRequest::CloseAnnotation { annotation },
                CallbackSet::none(),
            )
            .await?;
        done(OperationKind::CloseAnnotation, response)
    }

    pub async fn remove_annotation(&self, request: RemoveAnnotation) -> PoolResult<()> {
        let (page, target) = self.resolve_page(&request.page, None)?;
        let response = self
            .run(
                &target,
                NativeRequest::RemoveAnnotation {
                    page,
                    index: request.index,
                },
                CallbackSet::none(),
            )
            .await?;
        done(OperationKind::RemoveAnnotation, response)
    }
}
