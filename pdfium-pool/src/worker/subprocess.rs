//! Sub-process backend: the library lives in a `pdfium-pool-worker` child.
//!
//! Requests and callbacks share the child's stdin/stdout. While a request is
//! outstanding the host keeps reading: callback frames are answered in place,
//! and a callback may send nested request frames before it replies.

use std::io::{BufReader, ErrorKind};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bridge::{CallContext, NestedExecutor};
use crate::config::{BackendKind, LibrarySettings};
use crate::error::{PoolError, PoolResult};
use crate::handle::WorkerId;
use crate::native::NativeResult;
use crate::protocol::{Frame, FrameChannel, NativeRequest, NativeResponse};

use super::{Backend, Interrupter, worker_environment};

pub(crate) struct SubprocessBackend {
    worker: WorkerId,
    child: Arc<Mutex<Child>>,
    channel: FrameChannel<BufReader<ChildStdout>, ChildStdin>,
    /// Set once the pipe failed; the backend must be replaced
    broken: Option<String>,
}

impl SubprocessBackend {
    /// Start the worker process and wait for its ready frame.
    pub(crate) fn spawn(
        worker: WorkerId,
        program: &Path,
        settings: &LibrarySettings,
    ) -> PoolResult<Self> {
        let mut command = Command::new(program);
        command
            .envs(worker_environment(worker, settings))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = command.spawn().map_err(|e| PoolError::WorkerCrashed {
            worker,
            reason: format!("failed to start {}: {}", program.display(), e),
        })?;
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                return Err(PoolError::Internal {
                    message: "worker process pipes unavailable".to_string(),
                });
            }
        };

        let mut backend = Self {
            worker,
            child: Arc::new(Mutex::new(child)),
            channel: FrameChannel::new(BufReader::new(stdout), stdin),
            broken: None,
        };

        match backend.recv()? {
            Frame::Ready { pid, library } => {
                info!(worker = %worker, pid, library = %library, "Worker process ready");
                Ok(backend)
            }
            other => Err(backend.fail(format!("expected ready frame, got {:?}", other))),
        }
    }

    fn fail(&mut self, reason: String) -> PoolError {
        warn!(worker = %self.worker, reason = %reason, "Worker process channel failed");
        self.broken = Some(reason.clone());
        PoolError::WorkerCrashed {
            worker: self.worker,
            reason,
        }
    }

    fn send(&mut self, frame: &Frame) -> PoolResult<()> {
        match self.channel.send(frame) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(format!("write failed: {}", e))),
        }
    }

    fn recv(&mut self) -> PoolResult<Frame> {
        match self.channel.recv() {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(self.fail("worker process closed its output".to_string())),
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                Err(self.fail(format!("malformed frame: {}", e)))
            }
            Err(e) => Err(self.fail(format!("read failed: {}", e))),
        }
    }

    /// Send one request and serve callbacks until its response arrives.
    fn round_trip(
        &mut self,
        request: NativeRequest,
        context: &CallContext,
    ) -> PoolResult<NativeResult<NativeResponse>> {
        if let Some(reason) = &self.broken {
            return Err(PoolError::WorkerCrashed {
                worker: self.worker,
                reason: reason.clone(),
            });
        }

        let id = self.channel.next_id();
        self.send(&Frame::Request { id, request })?;

        loop {
            match self.recv()? {
                Frame::Response {
                    id: response_id,
                    result,
                } if response_id == id => return Ok(result),
                Frame::Callback {
                    id: callback_id,
                    request,
                } => {
                    debug!(worker = %self.worker, request = id, callback = callback_id, "Callback frame");
                    let result = context.invoke(request, self);
                    self.send(&Frame::CallbackReply {
                        id: callback_id,
                        result,
                    })?;
                }
                other => {
                    return Err(self.fail(format!(
                        "unexpected frame while waiting for response {}: {:?}",
                        id, other
                    )));
                }
            }
        }
    }
}

impl NestedExecutor for SubprocessBackend {
    fn execute_nested(
        &mut self,
        request: NativeRequest,
        context: &CallContext,
    ) -> PoolResult<NativeResult<NativeResponse>> {
        self.round_trip(request, context)
    }
}

impl Backend for SubprocessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Subprocess
    }

    fn execute(
        &mut self,
        request: NativeRequest,
        context: &Arc<CallContext>,
    ) -> PoolResult<NativeResult<NativeResponse>> {
        self.round_trip(request, context)
    }

    fn is_healthy(&mut self) -> bool {
        if self.broken.is_some() {
            return false;
        }
        matches!(self.child.lock().try_wait(), Ok(None))
    }

    fn shutdown(&mut self) {
        if self.broken.is_none() {
            let _ = self.channel.send(&Frame::Shutdown);
        }
        let mut child = self.child.lock();
        if let Ok(None) = child.try_wait() {
            let _ = child.kill();
        }
        let _ = child.wait();
        self.broken = Some("worker process shut down".to_string());
    }

    fn interrupter(&self) -> Interrupter {
        Interrupter::Process(Arc::clone(&self.child))
    }

    fn pid(&self) -> Option<u32> {
        Some(self.child.lock().id())
    }
}

impl Drop for SubprocessBackend {
    fn drop(&mut self) {
        let mut child = self.child.lock();
        if let Ok(None) = child.try_wait() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
