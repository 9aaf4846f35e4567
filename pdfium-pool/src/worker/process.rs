//! Worker-process side of the sub-process backend.
//!
//! [`serve`] answers request frames from the pool with one library instance.
//! A callback raised by the library becomes a callback frame; until the
//! matching reply arrives, request frames sent by the pool are treated as
//! nested calls and served on the same stack.

use std::io::{self, BufRead, Write};

use tracing::{debug, info, warn};

use crate::native::{CallbackBridge, NativeLibrary, NativeResult, dispatch};
use crate::protocol::{
    CallbackReply, CallbackRequest, Frame, FrameChannel, NativeError, NativeRequest,
};

/// Serve the pool on `reader`/`writer` until it sends a shutdown frame or
/// closes the pipe.
pub fn serve<R: BufRead, W: Write>(
    reader: R,
    writer: W,
    library: &dyn NativeLibrary,
) -> io::Result<()> {
    let mut server = Server {
        channel: FrameChannel::new(reader, writer),
        library,
        stopping: false,
    };
    server.channel.send(&Frame::Ready {
        pid: std::process::id(),
        library: library.name().to_string(),
    })?;
    info!(library = library.name(), "Worker serving");

    while !server.stopping {
        match server.channel.recv()? {
            Some(Frame::Request { id, request }) => server.answer(id, request)?,
            Some(Frame::Shutdown) | None => break,
            Some(other) => warn!(frame = ?other, "Ignoring unexpected frame"),
        }
    }
    info!("Worker stopping");
    Ok(())
}

struct Server<'a, R, W> {
    channel: FrameChannel<R, W>,
    library: &'a dyn NativeLibrary,
    stopping: bool,
}

impl<R: BufRead, W: Write> Server<'_, R, W> {
    fn answer(&mut self, id: u64, request: NativeRequest) -> io::Result<()> {
        let operation = request.operation();
        debug!(id, operation = %operation, "Request");
        let library = self.library;
        let mut bridge = ProcessBridge { server: self };
        let result = dispatch(library, request, &mut bridge);
        self.channel.send(&Frame::Response { id, result })
    }

    /// Send a callback frame and wait for its reply, serving nested requests
    /// in between.
    fn callback(&mut self, request: CallbackRequest) -> io::Result<Result<CallbackReply, String>> {
        let id = self.channel.next_id();
        self.channel.send(&Frame::Callback { id, request })?;
        loop {
            match self.channel.recv()? {
                Some(Frame::CallbackReply {
                    id: reply_id,
                    result,
                }) if reply_id == id => return Ok(result),
                Some(Frame::Request {
                    id: nested_id,
                    request,
                }) => self.answer(nested_id, request)?,
                Some(Frame::Shutdown) | None => {
                    self.stopping = true;
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "pool went away during a callback",
                    ));
                }
                Some(other) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unexpected frame during callback {}: {:?}", id, other),
                    ));
                }
            }
        }
    }
}

struct ProcessBridge<'s, 'a, R, W> {
    server: &'s mut Server<'a, R, W>,
}

impl<R: BufRead, W: Write> CallbackBridge for ProcessBridge<'_, '_, R, W> {
    fn invoke(&mut self, request: CallbackRequest) -> NativeResult<CallbackReply> {
        match self.server.callback(request) {
            Ok(reply) => reply.map_err(|message| NativeError::Callback { message }),
            Err(e) => Err(NativeError::Callback {
                message: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{MemoryLibrary, sample_document};
    use crate::protocol::{NativePage, NativeResponse, RenderArea};
    use std::io::Cursor;

    fn frames(input: &[Frame]) -> Cursor<Vec<u8>> {
        let mut bytes = Vec::new();
        for frame in input {
            serde_json::to_writer(&mut bytes, frame).unwrap();
            bytes.push(b'\n');
        }
        Cursor::new(bytes)
    }

    fn run(input: &[Frame]) -> Vec<Frame> {
        let library = MemoryLibrary::new();
        let mut out = Vec::new();
        serve(frames(input), &mut out, &library).unwrap();
        out.split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_slice(line).unwrap())
            .collect()
    }

    #[test]
    fn test_serve_requests_until_shutdown() {
        let output = run(&[
            Frame::Request {
                id: 1,
                request: NativeRequest::LoadDocument {
                    data: sample_document(&["one", "two", "three"], None),
                    password: None,
                },
            },
            Frame::Request {
                id: 2,
                request: NativeRequest::GetPageCount { document: 0x1000 },
            },
            Frame::Shutdown,
            Frame::Request {
                id: 3,
                request: NativeRequest::GetPageCount { document: 0x1000 },
            },
        ]);

        assert!(matches!(output[0], Frame::Ready { .. }));
        assert_eq!(
            output[1],
            Frame::Response {
                id: 1,
                result: Ok(NativeResponse::Document { document: 0x1000 })
            }
        );
        assert_eq!(
            output[2],
            Frame::Response {
                id: 2,
                result: Ok(NativeResponse::Count { count: 3 })
            }
        );
        assert_eq!(output.len(), 3);
    }

    #[test]
    fn test_callback_reply_and_nested_request() {
        let area = RenderArea {
            start_x: 0,
            start_y: 0,
            size_x: 10,
            size_y: 10,
            rotate: 0,
            flags: 0,
        };
        let output = run(&[
            Frame::Request {
                id: 1,
                request: NativeRequest::LoadDocument {
                    data: sample_document(&["only"], None),
                    password: None,
                },
            },
            Frame::Request {
                id: 2,
                request: NativeRequest::LoadPage {
                    document: 0x1000,
                    index: 0,
                },
            },
            Frame::Request {
                id: 3,
                request: NativeRequest::CreateBitmap {
                    width: 10,
                    height: 10,
                    alpha: false,
                },
            },
            Frame::Request {
                id: 4,
                request: NativeRequest::RenderPageBitmapStart {
                    bitmap: 0x1020,
                    page: NativePage::Reference { page: 0x1010 },
                    area,
                    pause: true,
                },
            },
            // Nested call issued while the pause callback is outstanding
            Frame::Request {
                id: 5,
                request: NativeRequest::GetPageCount { document: 0x1000 },
            },
            Frame::CallbackReply {
                id: 1,
                result: Ok(CallbackReply::Pause { pause: true }),
            },
        ]);

        let callback = output
            .iter()
            .position(|f| matches!(f, Frame::Callback { .. }))
            .unwrap();
        assert_eq!(
            output[callback],
            Frame::Callback {
                id: 1,
                request: CallbackRequest::NeedToPauseNow
            }
        );
        assert_eq!(
            output[callback + 1],
            Frame::Response {
                id: 5,
                result: Ok(NativeResponse::Count { count: 1 })
            }
        );
        assert!(matches!(
            output[callback + 2],
            Frame::Response { id: 4, result: Ok(NativeResponse::Render { .. }) }
        ));
    }
}
