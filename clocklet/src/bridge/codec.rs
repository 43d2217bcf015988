//! Framed codec for worker communication.
//!
//! Uses LinesCodec for framing + serde_json for serialization: the worker
//! speaks one JSON object per newline-terminated line on stdin/stdout.
//! Works over any AsyncRead/AsyncWrite (pipes, in-memory duplexes).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Codec that frames messages as lines and serializes with JSON.
///
/// Wraps LinesCodec and adds serde_json serialization. Lines that do not
/// parse as `T` are logged and skipped rather than poisoning the stream:
/// the worker's stdout may carry stray output from native device libraries,
/// and one bad line must not take down the whole read loop.
pub struct JsonLineCodec<T> {
    inner: LinesCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLineCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLineCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new(),
            _phantom: PhantomData,
        }
    }
}

fn into_io(err: LinesCodecError) -> io::Error {
    match err {
        LinesCodecError::Io(err) => err,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "line length limit exceeded")
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLineCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.inner.decode(src).map_err(into_io)? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(item) => return Ok(Some(item)),
                Err(err) => {
                    let snippet: String = line.chars().take(120).collect();
                    tracing::warn!(error = %err, line = %snippet, "Skipping unparseable worker line");
                }
            }
        }
        Ok(None)
    }
}

impl<T: Serialize> Encoder<T> for JsonLineCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding line");
        self.inner.encode(json, dst).map_err(into_io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{WireRequest, WireResponse};
    use serde_json::json;

    #[test]
    fn codec_roundtrip_request() {
        let mut codec = JsonLineCodec::<WireRequest>::new();
        let mut buf = BytesMut::new();

        let req = WireRequest {
            method: "get_devices".to_string(),
            params: json!({}),
            id: 7,
        };
        codec.encode(req.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, req);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn codec_roundtrip_response() {
        let mut codec = JsonLineCodec::<WireResponse>::new();
        let mut buf = BytesMut::new();

        let resp = WireResponse::success(3, json!([{"id": "d1"}]));
        codec.encode(resp.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, resp);
    }

    #[test]
    fn encode_frames_one_message_per_line() {
        let mut codec = JsonLineCodec::<WireRequest>::new();
        let mut buf = BytesMut::new();

        let req = WireRequest {
            method: "run_sync".to_string(),
            params: json!({}),
            id: 1,
        };
        codec.encode(req, &mut buf).unwrap();

        assert_eq!(buf.last(), Some(&b'\n'));
        let body = &buf[..buf.len() - 1];
        assert!(!body.contains(&b'\n'));
    }

    #[test]
    fn decode_drains_multiple_buffered_lines() {
        let mut codec = JsonLineCodec::<WireResponse>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"{\"id\": 1, \"result\": \"a\"}\n{\"id\": 2, \"result\": \"b\"}\n");

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(first.id, Some(1));
        assert_eq!(second.id, Some(2));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn unparseable_line_is_skipped_not_fatal() {
        let mut codec = JsonLineCodec::<WireResponse>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"device library says hi\n{\"id\": 9, \"result\": null}\n");

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.id, Some(9));
    }

    #[test]
    fn blank_lines_are_ignored() {
        let mut codec = JsonLineCodec::<WireResponse>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\n  \n{\"id\": 4, \"result\": true}\n");

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.id, Some(4));
    }
}
