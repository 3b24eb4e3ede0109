//! Length-prefixed message framing.
//!
//! Every message travels as a 4-byte big-endian length followed by the
//! encoded payload:
//!
//! ```text
//! +----------------+---------------------------+
//! | length (4 BE)  |  plist / json payload     |
//! +----------------+---------------------------+
//! ```

use tether_core::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::trace;

use crate::MAX_FRAME_SIZE;
use crate::codec::WireFormat;
use crate::error::{ProtocolError, ProtocolResult};

/// Encodes a message into a complete frame (length prefix + payload).
pub fn encode_frame(format: WireFormat, message: &Message) -> ProtocolResult<Vec<u8>> {
    let payload = format.encode(message)?;
    frame_payload(&payload, MAX_FRAME_SIZE)
}

/// Decodes a complete frame (length prefix + payload) into a message.
pub fn decode_frame(format: WireFormat, data: &[u8]) -> ProtocolResult<Message> {
    let Some(len_bytes) = data.get(..4) else {
        return Err(ProtocolError::IncompleteFrame {
            expected: 4,
            received: data.len(),
        });
    };
    let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
    check_len(len, MAX_FRAME_SIZE)?;

    let Some(payload) = data.get(4..4 + len) else {
        return Err(ProtocolError::IncompleteFrame {
            expected: 4 + len,
            received: data.len(),
        });
    };
    format.decode(payload)
}

fn frame_payload(payload: &[u8], max: u32) -> ProtocolResult<Vec<u8>> {
    check_len(payload.len(), max)?;
    let mut buffer = Vec::with_capacity(4 + payload.len());
    buffer.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buffer.extend_from_slice(payload);
    Ok(buffer)
}

fn check_len(len: usize, max: u32) -> ProtocolResult<()> {
    if len > max as usize {
        return Err(ProtocolError::FrameTooLarge { size: len, max });
    }
    if len == 0 {
        return Err(ProtocolError::EmptyFrame);
    }
    Ok(())
}

/// Reads length-prefixed frames from an async byte stream.
pub struct FrameReader<R> {
    reader: R,
    max_frame_size: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    #[must_use]
    pub fn with_max_frame_size(mut self, max: u32) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Reads one frame payload.
    ///
    /// Returns `Ok(None)` on a clean end of stream (EOF before any byte of
    /// a new frame). EOF inside a frame is [`ProtocolError::IncompleteFrame`].
    pub async fn read_frame(&mut self) -> ProtocolResult<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            let n = self.reader.read(&mut len_buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ProtocolError::IncompleteFrame {
                    expected: 4,
                    received: filled,
                });
            }
            filled += n;
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        check_len(len, self.max_frame_size)?;

        let mut payload = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.reader.read(&mut payload[filled..]).await?;
            if n == 0 {
                return Err(ProtocolError::IncompleteFrame {
                    expected: len,
                    received: filled,
                });
            }
            filled += n;
        }

        trace!(bytes = len, "frame read");
        Ok(Some(payload))
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Writes length-prefixed frames to an async byte stream.
pub struct FrameWriter<W> {
    writer: W,
    max_frame_size: u32,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    #[must_use]
    pub fn with_max_frame_size(mut self, max: u32) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Writes one frame and flushes it.
    pub async fn write_frame(&mut self, payload: &[u8]) -> ProtocolResult<()> {
        let frame = frame_payload(payload, self.max_frame_size)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        trace!(bytes = payload.len(), "frame written");
        Ok(())
    }

    /// Shuts down the write side of the stream.
    pub async fn shutdown(&mut self) -> ProtocolResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// A bidirectional stream of [`Message`]s over one byte connection.
pub struct MessageStream<S> {
    reader: FrameReader<ReadHalf<S>>,
    writer: FrameWriter<WriteHalf<S>>,
    format: WireFormat,
}

impl<S: AsyncRead + AsyncWrite> MessageStream<S> {
    pub fn new(stream: S, format: WireFormat) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: FrameReader::new(read),
            writer: FrameWriter::new(write),
            format,
        }
    }

    #[must_use]
    pub fn with_max_frame_size(mut self, max: u32) -> Self {
        self.reader.max_frame_size = max;
        self.writer.max_frame_size = max;
        self
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Encodes and sends one message.
    pub async fn send(&mut self, message: &Message) -> ProtocolResult<()> {
        let payload = self.format.encode(message)?;
        self.writer.write_frame(&payload).await
    }

    /// Receives and decodes one message.
    ///
    /// A clean end of stream is [`ProtocolError::ConnectionClosed`].
    pub async fn receive(&mut self) -> ProtocolResult<Message> {
        match self.reader.read_frame().await? {
            Some(payload) => self.format.decode(&payload),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Shuts down the write side, signalling end of stream to the peer.
    pub async fn shutdown(&mut self) -> ProtocolResult<()> {
        self.writer.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn ping() -> Message {
        Message::from_pairs([("Command", "Ping")])
    }

    #[test]
    fn encode_decode_frame() {
        let bytes = encode_frame(WireFormat::Xml, &ping()).unwrap();
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);

        assert_eq!(decode_frame(WireFormat::Xml, &bytes).unwrap(), ping());
    }

    #[test]
    fn decode_incomplete_length() {
        let result = decode_frame(WireFormat::Xml, &[0, 0]);
        assert!(matches!(
            result,
            Err(ProtocolError::IncompleteFrame { expected: 4, .. })
        ));
    }

    #[test]
    fn decode_incomplete_payload() {
        let mut data = vec![0, 0, 0, 100];
        data.extend_from_slice(&[0u8; 10]);
        assert!(matches!(
            decode_frame(WireFormat::Xml, &data),
            Err(ProtocolError::IncompleteFrame { expected: 104, .. })
        ));
    }

    #[test]
    fn frame_too_large() {
        let data = (MAX_FRAME_SIZE + 1).to_be_bytes();
        assert!(matches!(
            decode_frame(WireFormat::Xml, &data),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn reader_handles_multiple_frames_then_eof() {
        let mut bytes = encode_frame(WireFormat::Json, &ping()).unwrap();
        bytes.extend(encode_frame(WireFormat::Json, &Message::from_pairs([("Command", "Browse")])).unwrap());

        let mut reader = FrameReader::new(Cursor::new(bytes));
        assert!(reader.read_frame().await.unwrap().is_some());
        assert!(reader.read_frame().await.unwrap().is_some());
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reader_rejects_empty_frame() {
        let mut reader = FrameReader::new(Cursor::new(0u32.to_be_bytes().to_vec()));
        assert!(matches!(
            reader.read_frame().await,
            Err(ProtocolError::EmptyFrame)
        ));
    }

    #[tokio::test]
    async fn reader_reports_truncated_frame() {
        let mut bytes = encode_frame(WireFormat::Xml, &ping()).unwrap();
        bytes.truncate(bytes.len() - 3);

        let mut reader = FrameReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.read_frame().await,
            Err(ProtocolError::IncompleteFrame { .. })
        ));
    }

    #[tokio::test]
    async fn reader_honors_max_frame_size() {
        let bytes = encode_frame(WireFormat::Xml, &ping()).unwrap();
        let mut reader = FrameReader::new(Cursor::new(bytes)).with_max_frame_size(8);
        assert!(matches!(
            reader.read_frame().await,
            Err(ProtocolError::FrameTooLarge { max: 8, .. })
        ));
    }

    #[tokio::test]
    async fn message_stream_roundtrip_over_duplex() {
        let (client, device) = tokio::io::duplex(4096);
        let mut client = MessageStream::new(client, WireFormat::Binary);
        let mut device = MessageStream::new(device, WireFormat::Binary);

        client.send(&ping()).await.unwrap();
        assert_eq!(device.receive().await.unwrap(), ping());

        let reply = Message::from_pairs([("Status", "Complete")]);
        device.send(&reply).await.unwrap();
        assert_eq!(client.receive().await.unwrap(), reply);
    }

    #[tokio::test]
    async fn message_stream_reports_peer_close() {
        let (client, device) = tokio::io::duplex(64);
        let mut client = MessageStream::new(client, WireFormat::Xml);
        drop(device);

        assert!(matches!(
            client.receive().await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }
}
