//! Sandbox backend: the library is a WebAssembly module run by wasmtime.
//!
//! Guest ABI, all payloads JSON in guest memory:
//!
//! - `memory`: the guest's linear memory
//! - `pdfium_alloc(len) -> ptr`: reserve `len` bytes for the host to write
//! - `pdfium_dispatch(ptr, len) -> packed`: run one request, return a
//!   `Result<NativeResponse, NativeError>`
//! - import `env.pdfium_host_call(ptr, len) -> packed`: raise a callback,
//!   receive a `Result<CallbackReply, String>`
//!
//! `packed` is `ptr << 32 | len`. Each worker owns its engine so an epoch
//! interrupt only reaches the call that timed out.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};
use wasmtime::{
    AsContextMut, Caller, Config, Engine, Linker, Memory, Module, Store, Trap, TypedFunc,
};

use crate::bridge::{CallContext, NestedExecutor};
use crate::config::BackendKind;
use crate::error::{PoolError, PoolResult};
use crate::handle::WorkerId;
use crate::native::NativeResult;
use crate::protocol::{CallbackReply, CallbackRequest, NativeRequest, NativeResponse};

use super::{Backend, Interrupter};

const HOST_MODULE: &str = "env";
const HOST_CALL: &str = "pdfium_host_call";

#[derive(Clone)]
struct GuestExports {
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    dispatch: TypedFunc<(i32, i32), i64>,
}

#[derive(Default)]
struct SandboxState {
    context: Option<Arc<CallContext>>,
    exports: Option<GuestExports>,
}

pub(crate) struct SandboxBackend {
    worker: WorkerId,
    engine: Engine,
    store: Store<SandboxState>,
    exports: GuestExports,
    trapped: Option<String>,
}

impl SandboxBackend {
    /// Compile and instantiate the guest module at `path`.
    pub(crate) fn spawn(worker: WorkerId, path: &Path) -> PoolResult<Self> {
        let startup = |e: wasmtime::Error| PoolError::WorkerCrashed {
            worker,
            reason: format!("sandbox start failed: {:#}", e),
        };

        let mut config = Config::new();
        config.epoch_interruption(true);
        let engine = Engine::new(&config).map_err(startup)?;
        let module = Module::from_file(&engine, path).map_err(startup)?;

        let mut linker: Linker<SandboxState> = Linker::new(&engine);
        linker
            .func_wrap(
                HOST_MODULE,
                HOST_CALL,
                |mut caller: Caller<'_, SandboxState>, ptr: i32, len: i32| {
                    host_call(&mut caller, ptr, len)
                },
            )
            .map_err(startup)?;

        let mut store = Store::new(&engine, SandboxState::default());
        store.set_epoch_deadline(1);
        let instance = linker.instantiate(&mut store, &module).map_err(startup)?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| startup(wasmtime::Error::msg("guest does not export memory")))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, "pdfium_alloc")
            .map_err(startup)?;
        let dispatch = instance
            .get_typed_func::<(i32, i32), i64>(&mut store, "pdfium_dispatch")
            .map_err(startup)?;
        let exports = GuestExports {
            memory,
            alloc,
            dispatch,
        };
        store.data_mut().exports = Some(exports.clone());

        info!(worker = %worker, module = %path.display(), "Sandbox instantiated");
        Ok(Self {
            worker,
            engine,
            store,
            exports,
            trapped: None,
        })
    }

    fn fail(&mut self, reason: String) -> PoolError {
        warn!(worker = %self.worker, reason = %reason, "Sandbox failed");
        self.trapped = Some(reason.clone());
        PoolError::WorkerCrashed {
            worker: self.worker,
            reason,
        }
    }
}

impl Backend for SandboxBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sandbox
    }

    fn execute(
        &mut self,
        request: NativeRequest,
        context: &Arc<CallContext>,
    ) -> PoolResult<NativeResult<NativeResponse>> {
        if let Some(reason) = &self.trapped {
            return Err(PoolError::WorkerCrashed {
                worker: self.worker,
                reason: reason.clone(),
            });
        }
        let input = serde_json::to_vec(&request).map_err(|e| PoolError::Internal {
            message: format!("failed to encode request: {}", e),
        })?;

        self.store.data_mut().context = Some(Arc::clone(context));
        self.store.set_epoch_deadline(1);
        let output = call_guest(&mut self.store, &self.exports, &input);
        self.store.data_mut().context = None;

        match output {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| self.fail(format!("malformed guest response: {}", e))),
            Err(e) => {
                let reason = match e.downcast_ref::<Trap>() {
                    Some(Trap::Interrupt) => "guest interrupted".to_string(),
                    _ => format!("guest trapped: {:#}", e),
                };
                Err(self.fail(reason))
            }
        }
    }

    fn is_healthy(&mut self) -> bool {
        self.trapped.is_none()
    }

    fn shutdown(&mut self) {
        self.store.data_mut().context = None;
        self.trapped = Some("sandbox shut down".to_string());
    }

    fn interrupter(&self) -> Interrupter {
        Interrupter::Epoch(self.engine.clone())
    }
}

/// Copy `input` into the guest, run its dispatcher and copy the result out.
fn call_guest(
    mut store: impl AsContextMut<Data = SandboxState>,
    exports: &GuestExports,
    input: &[u8],
) -> wasmtime::Result<Vec<u8>> {
    let (ptr, len) = write_guest(&mut store, exports, input)?;
    let packed = exports.dispatch.call(&mut store, (ptr, len))?;
    read_guest(&mut store, exports, packed)
}

fn write_guest(
    mut store: impl AsContextMut<Data = SandboxState>,
    exports: &GuestExports,
    bytes: &[u8],
) -> wasmtime::Result<(i32, i32)> {
    let len = i32::try_from(bytes.len())?;
    let ptr = exports.alloc.call(&mut store, len)?;
    exports
        .memory
        .write(&mut store, usize::try_from(ptr)?, bytes)?;
    Ok((ptr, len))
}

fn read_guest(
    mut store: impl AsContextMut<Data = SandboxState>,
    exports: &GuestExports,
    packed: i64,
) -> wasmtime::Result<Vec<u8>> {
    let ptr = ((packed as u64) >> 32) as usize;
    let len = ((packed as u64) & 0xffff_ffff) as usize;
    let mut bytes = vec![0; len];
    exports.memory.read(&mut store, ptr, &mut bytes)?;
    Ok(bytes)
}

fn pack(ptr: i32, len: i32) -> i64 {
    ((ptr as u32 as i64) << 32) | len as u32 as i64
}

/// `env.pdfium_host_call`: serve one callback raised by the guest.
fn host_call(caller: &mut Caller<'_, SandboxState>, ptr: i32, len: i32) -> wasmtime::Result<i64> {
    let exports = caller
        .data()
        .exports
        .clone()
        .ok_or_else(|| wasmtime::Error::msg("guest exports not bound"))?;
    let context = caller.data().context.clone();

    let mut bytes = vec![0; usize::try_from(len)?];
    exports
        .memory
        .read(&mut *caller, usize::try_from(ptr)?, &mut bytes)?;

    let reply: Result<CallbackReply, String> =
        match (serde_json::from_slice::<CallbackRequest>(&bytes), context) {
            (Ok(request), Some(context)) => {
                let mut nested = SandboxNested {
                    caller: &mut *caller,
                    exports: &exports,
                    worker: context.worker(),
                };
                context.invoke(request, &mut nested)
            }
            (Ok(_), None) => Err(PoolError::CallbackExpired.to_string()),
            (Err(e), _) => Err(format!("malformed callback request: {}", e)),
        };

    let out = serde_json::to_vec(&reply)?;
    let (ptr, len) = write_guest(&mut *caller, &exports, &out)?;
    Ok(pack(ptr, len))
}

/// Nested requests re-enter the guest dispatcher from inside a host call.
struct SandboxNested<'a, 'c> {
    caller: &'a mut Caller<'c, SandboxState>,
    exports: &'a GuestExports,
    worker: WorkerId,
}

impl NestedExecutor for SandboxNested<'_, '_> {
    fn execute_nested(
        &mut self,
        request: NativeRequest,
        _context: &CallContext,
    ) -> PoolResult<NativeResult<NativeResponse>> {
        let worker = self.worker;
        let crashed = |reason: String| PoolError::WorkerCrashed { worker, reason };
        let input = serde_json::to_vec(&request).map_err(|e| PoolError::Internal {
            message: format!("failed to encode request: {}", e),
        })?;
        let output = call_guest(&mut *self.caller, self.exports, &input)
            .map_err(|e| crashed(format!("guest trapped in nested call: {:#}", e)))?;
        serde_json::from_slice(&output)
            .map_err(|e| crashed(format!("malformed guest response: {}", e)))
    }
}
