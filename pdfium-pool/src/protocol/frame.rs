//! JSON-lines framing between the pool and a worker process.

use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};

use super::{CallbackReply, CallbackRequest, NativeError, NativeRequest, NativeResponse};

/// One line on the worker pipe.
///
/// Requests and callbacks carry their own correlation ids so a callback
/// exchange can nest inside an outer request, and a nested request inside
/// a callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame written by a worker once its library is open.
    Ready { pid: u32, library: String },
    Request {
        id: u64,
        request: NativeRequest,
    },
    Response {
        id: u64,
        result: Result<NativeResponse, NativeError>,
    },
    Callback {
        id: u64,
        request: CallbackRequest,
    },
    CallbackReply {
        id: u64,
        result: Result<CallbackReply, String>,
    },
    Shutdown,
}

/// Blocking frame reader/writer over a pair of byte streams.
pub(crate) struct FrameChannel<R, W> {
    reader: R,
    writer: W,
    next_id: u64,
    line: String,
}

impl<R: BufRead, W: Write> FrameChannel<R, W> {
    pub(crate) fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            next_id: 1,
            line: String::new(),
        }
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn send(&mut self, frame: &Frame) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.writer, frame)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    /// Read the next frame. `Ok(None)` means the other side closed the pipe.
    pub(crate) fn recv(&mut self) -> std::io::Result<Option<Frame>> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            let line = self.line.trim();
            if line.is_empty() {
                continue;
            }
            return serde_json::from_str(line)
                .map(Some)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e));
        }
    }
}

/// Serde adapter storing byte payloads as standard base64.
pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frames_over_a_pipe() {
        let mut out = Vec::new();
        {
            let mut channel = FrameChannel::new(Cursor::new(Vec::new()), &mut out);
            let id = channel.next_id();
            channel
                .send(&Frame::Request {
                    id,
                    request: NativeRequest::GetPageCount { document: 3 },
                })
                .unwrap();
            let id = channel.next_id();
            channel
                .send(&Frame::Callback {
                    id,
                    request: CallbackRequest::NeedToPauseNow,
                })
                .unwrap();
        }

        let text = String::from_utf8(out.clone()).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.starts_with(r#"{"type":"request","id":1,"#));

        let mut channel = FrameChannel::new(Cursor::new(out), Vec::new());
        assert!(matches!(
            channel.recv().unwrap(),
            Some(Frame::Request { id: 1, .. })
        ));
        assert!(matches!(
            channel.recv().unwrap(),
            Some(Frame::Callback { id: 2, .. })
        ));
        assert_eq!(channel.recv().unwrap(), None);
    }

    #[test]
    fn test_malformed_frame_is_an_error() {
        let mut channel = FrameChannel::new(Cursor::new(b"{not json\n".to_vec()), Vec::new());
        let err = channel.recv().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_error_results_round_trip() {
        let frame = Frame::Response {
            id: 9,
            result: Err(NativeError::LastError { code: 4 }),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(serde_json::from_str::<Frame>(&json).unwrap(), frame);
    }
}
