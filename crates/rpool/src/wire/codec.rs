//! Length-delimited JSON frames over blocking readers and writers.

use std::io::{self, Read, Write};
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LengthDelimitedCodecError};

use crate::error::ConnectionError;

const READ_CHUNK: usize = 8 * 1024;

/// Largest frame accepted in either direction unless configured otherwise.
/// Engine results can be whole data frames, so this is well above the
/// codec's 8 MiB default.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Frames messages with a 4-byte length prefix and serializes them as JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Frames whose body is longer than `max` bytes fail to encode or decode.
    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

/// Maps the length codec's size rejection to a readable protocol error.
fn oversized(err: &io::Error, direction: &str, max: usize) -> Option<ConnectionError> {
    err.get_ref()
        .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>())
        .then(|| ConnectionError::Protocol(format!("{direction} frame exceeds {max} bytes")))
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}

/// Blocking request/response channel over a reader/writer pair.
///
/// Bytes read past the end of one frame are kept for the next `recv`. An
/// oversized incoming frame is never consumed, so once one is seen every
/// later `recv` fails the same way until the peer is replaced.
pub struct FramedChannel<R, W> {
    reader: R,
    writer: W,
    read_buf: BytesMut,
    max_frame_length: usize,
}

impl<R: Read, W: Write> FramedChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }

    pub fn send<T: Serialize>(&mut self, item: T) -> Result<(), ConnectionError> {
        let max = self.max_frame_length;
        let mut frame = BytesMut::new();
        JsonCodec::<T>::with_max_frame_length(max)
            .encode(item, &mut frame)
            .map_err(|e| {
                oversized(&e, "outgoing", max)
                    .unwrap_or_else(|| ConnectionError::Protocol(e.to_string()))
            })?;
        self.writer
            .write_all(&frame)
            .and_then(|()| self.writer.flush())
            .map_err(|e| ConnectionError::from_io(&e))
    }

    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<T, ConnectionError> {
        let max = self.max_frame_length;
        let mut codec = JsonCodec::<T>::with_max_frame_length(max);
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(item) = codec.decode(&mut self.read_buf).map_err(|e| {
                oversized(&e, "incoming", max).unwrap_or_else(|| ConnectionError::from_io(&e))
            })? {
                return Ok(item);
            }

            let n = match self.reader.read(&mut chunk) {
                Ok(0) => {
                    return Err(ConnectionError::TransportClosed(
                        "engine closed its output".into(),
                    ));
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ConnectionError::from_io(&e)),
            };
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Send `request` and wait for the matching response.
    pub fn request<Req: Serialize, Resp: DeserializeOwned>(
        &mut self,
        request: Req,
    ) -> Result<Resp, ConnectionError> {
        self.send(request)?;
        self.recv()
    }

    pub fn into_parts(self) -> (R, W) {
        (self.reader, self.writer)
    }
}
