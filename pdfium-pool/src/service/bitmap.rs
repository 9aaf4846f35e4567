use crate::bridge::CallbackSet;
use crate::error::PoolResult;
use crate::handle::HandleKind;
use crate::protocol::{NativeRequest, OperationKind};
use crate::requests::{CreateBitmap, DestroyBitmap};
use crate::responses::BitmapResponse;

use super::{PdfiumService, Target, created, done};

impl PdfiumService {
    pub async fn create_bitmap(&self, request: CreateBitmap) -> PoolResult<BitmapResponse> {
        let target = match request.document {
            Some(document) => {
                let (_, target) = self.resolve(document, HandleKind::Document, None)?;
                Target {
                    anchor: HandleKind::Bitmap,
                    ..target
                }
            }
            // Not tied to a session: the bitmap goes away only when destroyed
            // or when its worker restarts.
            None => {
                let worker = self.pool.any_worker()?;
                Target {
                    worker: worker.id(),
                    generation: worker.generation(),
                    session: None,
                    anchor: HandleKind::Bitmap,
                }
            }
        };

        let response = self
            .run(
                &target,
                NativeRequest::CreateBitmap {
                    width: request.width,
                    height: request.height,
                    alpha: request.alpha,
                },
                CallbackSet::none(),
            )
            .await?;
        let native = created(OperationKind::CreateBitmap, response)?;
        let bitmap = self
            .adopt(
                &target,
                native,
                HandleKind::Bitmap,
                NativeRequest::DestroyBitmap { bitmap: native },
            )
            .await?;
        Ok(BitmapResponse { bitmap })
    }

    pub async fn destroy_bitmap(&self, request: DestroyBitmap) -> PoolResult<()> {
        let (bitmap, target) = self.resolve(request.bitmap, HandleKind::Bitmap, None)?;
        self.pool.registry().invalidate(request.bitmap);
        let response = self
            .run(
                &target,
                NativeRequest::DestroyBitmap { bitmap },
                CallbackSet::none(),
            )
            .await?;
        done(OperationKind::DestroyBitmap, response)
    }
}
