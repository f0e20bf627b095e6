//! Frame encoding and decoding for the dmsg wire protocol.
//!
//! Every frame is a 5-byte header followed by the payload:
//!
//! ```text
//! +--------+-------------+--------------+-------------------+
//! | type   | stream_id   | payload_len  | payload ...       |
//! | 1 byte | 2 bytes BE  | 2 bytes BE   | payload_len bytes |
//! +--------+-------------+--------------+-------------------+
//! ```

use crate::error::{Error, ErrorCode, FrameError};
use crate::{FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Session handshake message (stream 0 only)
    Ok = 0x00,
    /// Stream dial request
    Request = 0x01,
    /// Stream dial acceptance
    Accept = 0x02,
    /// Stream close or dial rejection
    Close = 0x03,
    /// Stream payload
    Fwd = 0x0a,
    /// Cumulative read offset
    Ack = 0x0b,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Ok),
            0x01 => Ok(Self::Request),
            0x02 => Ok(Self::Accept),
            0x03 => Ok(Self::Close),
            0x0a => Ok(Self::Fwd),
            0x0b => Ok(Self::Ack),
            _ => Err(FrameError::InvalidFrameType(value)),
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "OK",
            Self::Request => "REQUEST",
            Self::Accept => "ACCEPT",
            Self::Close => "CLOSE",
            Self::Fwd => "FWD",
            Self::Ack => "ACK",
        })
    }
}

/// An owned frame
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    frame_type: FrameType,
    stream_id: u16,
    payload: Vec<u8>,
}

impl Frame {
    /// Build a frame; fails if the payload does not fit the length field.
    pub fn new(frame_type: FrameType, stream_id: u16, payload: Vec<u8>) -> Result<Self, FrameError> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(FrameError::PayloadOverflow(payload.len()));
        }
        Ok(Self {
            frame_type,
            stream_id,
            payload,
        })
    }

    /// FWD frame carrying `data`
    pub fn fwd(stream_id: u16, data: &[u8]) -> Result<Self, FrameError> {
        Self::new(FrameType::Fwd, stream_id, data.to_vec())
    }

    /// ACK frame reporting a cumulative read offset
    #[must_use]
    pub fn ack(stream_id: u16, offset: u64) -> Self {
        Self {
            frame_type: FrameType::Ack,
            stream_id,
            payload: offset.to_be_bytes().to_vec(),
        }
    }

    /// CLOSE frame with a reason code
    #[must_use]
    pub fn close(stream_id: u16, code: ErrorCode) -> Self {
        Self {
            frame_type: FrameType::Close,
            stream_id,
            payload: vec![code.0],
        }
    }

    /// Frame type
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    /// Stream id
    #[must_use]
    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    /// Payload bytes
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the frame, returning its payload
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Same frame under another stream id
    #[must_use]
    pub fn with_stream_id(mut self, stream_id: u16) -> Self {
        self.stream_id = stream_id;
        self
    }

    /// Decode the offset of an ACK frame
    pub fn ack_offset(&self) -> Result<u64, FrameError> {
        let bytes: [u8; 8] = self
            .payload
            .as_slice()
            .try_into()
            .map_err(|_| FrameError::InvalidPayload {
                kind: "ACK",
                len: self.payload.len(),
            })?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Decode the reason of a CLOSE frame; an empty payload is a normal close
    pub fn close_code(&self) -> Result<ErrorCode, FrameError> {
        match self.payload.as_slice() {
            [] => Ok(ErrorCode::NORMAL),
            [code] => Ok(ErrorCode(*code)),
            _ => Err(FrameError::InvalidPayload {
                kind: "CLOSE",
                len: self.payload.len(),
            }),
        }
    }

    /// Encoded size in bytes
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Serialize into `buf`
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.encoded_len());
        buf.push(self.frame_type as u8);
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        // Length is bounded by construction.
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
    }

    /// Serialize to a fresh buffer
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Parse one frame from the front of `data`, returning it and the
    /// number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), FrameError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: FRAME_HEADER_SIZE,
                actual: data.len(),
            });
        }
        let (frame_type, stream_id, len) = parse_header(&data[..FRAME_HEADER_SIZE])?;
        let total = FRAME_HEADER_SIZE + len;
        if data.len() < total {
            return Err(FrameError::TooShort {
                expected: total,
                actual: data.len(),
            });
        }
        let frame = Self {
            frame_type,
            stream_id,
            payload: data[FRAME_HEADER_SIZE..total].to_vec(),
        };
        Ok((frame, total))
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("type", &self.frame_type)
            .field("stream_id", &self.stream_id)
            .field("len", &self.payload.len())
            .finish()
    }
}

fn parse_header(header: &[u8]) -> Result<(FrameType, u16, usize), FrameError> {
    let frame_type = FrameType::try_from(header[0])?;
    let stream_id = u16::from_be_bytes([header[1], header[2]]);
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    Ok((frame_type, stream_id, len))
}

/// Read exactly one frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, Error>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let (frame_type, stream_id, len) = parse_header(&header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Frame {
        frame_type,
        stream_id,
        payload,
    })
}

/// Write one frame without flushing.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&frame.encode()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_layout() {
        let frame = Frame::new(FrameType::Fwd, 0x0102, b"hey".to_vec()).unwrap();
        assert_eq!(frame.encode(), vec![0x0a, 0x01, 0x02, 0x00, 0x03, b'h', b'e', b'y']);
    }

    #[test]
    fn test_decode_reports_consumed() {
        let mut buf = Frame::ack(9, 1234).encode();
        buf.extend_from_slice(&Frame::close(9, ErrorCode(56)).encode());

        let (first, used) = Frame::decode(&buf).unwrap();
        assert_eq!(first.frame_type(), FrameType::Ack);
        assert_eq!(first.ack_offset().unwrap(), 1234);

        let (second, _) = Frame::decode(&buf[used..]).unwrap();
        assert_eq!(second.close_code().unwrap(), ErrorCode(56));
    }

    #[test]
    fn test_too_short() {
        assert!(matches!(
            Frame::decode(&[0x0a, 0, 1]),
            Err(FrameError::TooShort { .. })
        ));
        assert!(matches!(
            Frame::decode(&[0x0a, 0, 1, 0, 9, 1]),
            Err(FrameError::TooShort { expected: 14, actual: 6 })
        ));
    }

    #[test]
    fn test_invalid_type() {
        assert_eq!(
            Frame::decode(&[0x7f, 0, 0, 0, 0]).unwrap_err(),
            FrameError::InvalidFrameType(0x7f)
        );
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let err = Frame::new(FrameType::Fwd, 1, vec![0; MAX_FRAME_PAYLOAD + 1]).unwrap_err();
        assert_eq!(err, FrameError::PayloadOverflow(MAX_FRAME_PAYLOAD + 1));
    }

    #[test]
    fn test_control_payload_sizes() {
        let bad_ack = Frame::new(FrameType::Ack, 1, vec![1, 2, 3]).unwrap();
        assert!(bad_ack.ack_offset().is_err());
        let empty_close = Frame::new(FrameType::Close, 1, vec![]).unwrap();
        assert_eq!(empty_close.close_code().unwrap(), ErrorCode::NORMAL);
        let bad_close = Frame::new(FrameType::Close, 1, vec![1, 2]).unwrap();
        assert!(bad_close.close_code().is_err());
    }

    #[tokio::test]
    async fn test_async_read_write() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let sent = Frame::fwd(7, &[0xAB; 200]).unwrap();
        let writer = {
            let sent = sent.clone();
            tokio::spawn(async move { write_frame(&mut a, &sent).await })
        };
        let got = read_frame(&mut b).await.unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(got, sent);
    }

    #[tokio::test]
    async fn test_read_frame_eof() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(read_frame(&mut b).await, Err(Error::Io(_))));
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = Frame::decode(&data);
        }

        #[test]
        fn prop_concatenated_frames_split_cleanly(
            frames in proptest::collection::vec(
                (prop_oneof![Just(FrameType::Fwd), Just(FrameType::Request), Just(FrameType::Accept)],
                 any::<u16>(),
                 proptest::collection::vec(any::<u8>(), 0..300)),
                1..8,
            )
        ) {
            let frames: Vec<Frame> = frames
                .into_iter()
                .map(|(t, id, p)| Frame::new(t, id, p).unwrap())
                .collect();
            let mut buf = Vec::new();
            for f in &frames {
                f.encode_into(&mut buf);
            }
            let mut offset = 0;
            for expected in &frames {
                let (got, used) = Frame::decode(&buf[offset..]).unwrap();
                prop_assert_eq!(&got, expected);
                offset += used;
            }
            prop_assert_eq!(offset, buf.len());
        }
    }
}
