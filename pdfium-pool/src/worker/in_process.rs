//! In-process backend: the library lives in this process.

use std::sync::Arc;

use crate::bridge::{CallContext, NestedExecutor};
use crate::config::BackendKind;
use crate::error::PoolResult;
use crate::native::{CallbackBridge, NativeLibrary, NativeResult, dispatch};
use crate::protocol::{CallbackReply, CallbackRequest, NativeError, NativeRequest, NativeResponse};

use super::{Backend, Interrupter};

pub(crate) struct InProcessBackend {
    library: Box<dyn NativeLibrary>,
}

impl InProcessBackend {
    pub(crate) fn new(library: Box<dyn NativeLibrary>) -> Self {
        Self { library }
    }
}

impl Backend for InProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::InProcess
    }

    fn execute(
        &mut self,
        request: NativeRequest,
        context: &Arc<CallContext>,
    ) -> PoolResult<NativeResult<NativeResponse>> {
        let library = self.library.as_ref();
        let mut bridge = DirectBridge { library, context };
        Ok(dispatch(library, request, &mut bridge))
    }

    fn is_healthy(&mut self) -> bool {
        true
    }

    fn shutdown(&mut self) {}

    fn interrupter(&self) -> Interrupter {
        Interrupter::None
    }
}

/// Callbacks are plain function calls into the call context.
struct DirectBridge<'a> {
    library: &'a dyn NativeLibrary,
    context: &'a CallContext,
}

impl CallbackBridge for DirectBridge<'_> {
    fn invoke(&mut self, request: CallbackRequest) -> NativeResult<CallbackReply> {
        let mut nested = DirectNested {
            library: self.library,
        };
        self.context
            .invoke(request, &mut nested)
            .map_err(|message| NativeError::Callback { message })
    }
}

/// Nested operations re-enter the same library on the same thread.
struct DirectNested<'a> {
    library: &'a dyn NativeLibrary,
}

impl NestedExecutor for DirectNested<'_> {
    fn execute_nested(
        &mut self,
        request: NativeRequest,
        context: &CallContext,
    ) -> PoolResult<NativeResult<NativeResponse>> {
        let mut bridge = DirectBridge {
            library: self.library,
            context,
        };
        Ok(dispatch(self.library, request, &mut bridge))
    }
}
