use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::site::SiteId;

/// fixed size of a data frame header: seq (8) + origin site (4) + payload length (8)
pub const DATA_HEADER_LEN: usize = 20;

/// Error while re-segmenting the byte stream into frames.
///
/// Any framing error is fatal for the connection it occurred on: once the
///  reader's position in the stream is in doubt there is no way to resynchronize,
///  so the connection must be torn down.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("declared payload length {declared} exceeds the configured maximum of {max}")]
    PayloadTooLarge { declared: u64, max: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// true if the peer closed the connection rather than violating the protocol
    pub fn is_disconnect(&self) -> bool {
        matches!(self, FrameError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// One replicated message on the wire: the fixed-size header immediately
///  followed by exactly `payload length` bytes of payload, no padding and no
///  delimiter. All integers are big-endian.
///
/// ```ascii
/// 0:  sequence number (u64)
/// 8:  originating site id (u32)
/// 12: payload length (u64)
/// 20: payload bytes
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub seq: u64,
    pub origin_site: SiteId,
    pub payload: Bytes,
}

impl DataFrame {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.seq);
        buf.put_u32(self.origin_site);
        buf.put_u64(self.payload.len().prechecked_cast());
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(DATA_HEADER_LEN + self.payload.len());
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Reads exactly one frame from the stream, blocking until it is complete.
    ///
    /// The declared payload length is validated against the configured maximum
    ///  *before* any payload bytes are read, so a corrupted or hostile length
    ///  field cannot trigger a huge allocation.
    pub async fn read(stream: &mut (impl AsyncRead + Unpin), max_payload_size: usize) -> Result<DataFrame, FrameError> {
        let mut header = [0u8; DATA_HEADER_LEN];
        stream.read_exact(&mut header).await?;

        let mut header_buf = &header[..];
        let seq = header_buf.get_u64();
        let origin_site = header_buf.get_u32();
        let payload_len = header_buf.get_u64();

        if payload_len > max_payload_size.safe_cast() {
            return Err(FrameError::PayloadTooLarge { declared: payload_len, max: max_payload_size });
        }

        let mut payload = vec![0u8; payload_len.prechecked_cast()];
        stream.read_exact(&mut payload).await?;

        Ok(DataFrame {
            seq,
            origin_site,
            payload: payload.into(),
        })
    }
}

/// Acknowledgment of one data frame, written back on the connection the frame
///  arrived on. Fixed size, big-endian.
///
/// ```ascii
/// 0: sequence number of the acknowledged frame (u64)
/// 8: responding site id (u32)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrame {
    pub seq: u64,
    pub site_id: SiteId,
}

impl AckFrame {
    pub const SERIALIZED_LEN: usize = 12;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.seq);
        buf.put_u32(self.site_id);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SERIALIZED_LEN);
        self.ser(&mut buf);
        buf.freeze()
    }

    pub async fn read(stream: &mut (impl AsyncRead + Unpin)) -> Result<AckFrame, FrameError> {
        let mut buf = [0u8; Self::SERIALIZED_LEN];
        stream.read_exact(&mut buf).await?;

        let mut frame_buf = &buf[..];
        Ok(AckFrame {
            seq: frame_buf.get_u64(),
            site_id: frame_buf.get_u32(),
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, Bytes, BytesMut};
    use rstest::rstest;

    use crate::frame::{AckFrame, DataFrame, FrameError, DATA_HEADER_LEN};

    #[rstest]
    #[case::empty_payload(DataFrame { seq: 0, origin_site: 1, payload: Bytes::new() })]
    #[case::small_payload(DataFrame { seq: 17, origin_site: 3, payload: Bytes::from_static(b"hello wan") })]
    #[case::max_payload(DataFrame { seq: u64::MAX, origin_site: u32::MAX, payload: Bytes::from(vec![0xab; 64]) })]
    #[tokio::test]
    async fn test_data_frame_round_trip(#[case] frame: DataFrame) {
        let encoded = frame.to_bytes();
        assert_eq!(encoded.len(), DATA_HEADER_LEN + frame.payload.len());

        let decoded = DataFrame::read(&mut encoded.as_ref(), 64).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn test_data_frames_resegment_from_continuous_stream() {
        let first = DataFrame { seq: 4, origin_site: 2, payload: Bytes::from_static(b"abc") };
        let second = DataFrame { seq: 5, origin_site: 2, payload: Bytes::from_static(b"") };
        let third = DataFrame { seq: 6, origin_site: 2, payload: Bytes::from_static(b"defgh") };

        let mut stream = BytesMut::new();
        first.ser(&mut stream);
        second.ser(&mut stream);
        third.ser(&mut stream);

        let stream = stream.freeze();
        let mut reader: &[u8] = &stream;
        let reader = &mut reader;
        assert_eq!(DataFrame::read(reader, 1024).await.unwrap(), first);
        assert_eq!(DataFrame::read(reader, 1024).await.unwrap(), second);
        assert_eq!(DataFrame::read(reader, 1024).await.unwrap(), third);
        assert!(DataFrame::read(reader, 1024).await.err().unwrap().is_disconnect());
    }

    #[tokio::test]
    async fn test_data_frame_header_is_big_endian() {
        let frame = DataFrame { seq: 0x0102030405060708, origin_site: 0x0a0b0c0d, payload: Bytes::from_static(b"x") };
        let encoded = frame.to_bytes();

        assert_eq!(&encoded[0..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&encoded[8..12], &[0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(&encoded[12..20], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&encoded[20..], b"x");
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected_without_reading_it() {
        let mut header = BytesMut::new();
        header.put_u64(0);
        header.put_u32(1);
        header.put_u64(1024 * 1024);
        // NB: no payload bytes follow - decode must fail on the header alone

        let result = DataFrame::read(&mut header.freeze().as_ref(), 1024).await;
        match result {
            Err(FrameError::PayloadTooLarge { declared, max }) => {
                assert_eq!(declared, 1024 * 1024);
                assert_eq!(max, 1024);
            }
            other => panic!("expected PayloadTooLarge, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_payload_length_at_maximum_is_accepted() {
        let frame = DataFrame { seq: 1, origin_site: 1, payload: Bytes::from(vec![7u8; 32]) };
        let encoded = frame.to_bytes();

        let decoded = DataFrame::read(&mut encoded.as_ref(), 32).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn test_truncated_header_is_a_disconnect() {
        let frame = DataFrame { seq: 1, origin_site: 1, payload: Bytes::from_static(b"abc") };
        let encoded = frame.to_bytes();

        let err = DataFrame::read(&mut &encoded[..DATA_HEADER_LEN - 3], 1024).await.err().unwrap();
        assert!(err.is_disconnect());
    }

    #[rstest]
    #[case(AckFrame { seq: 0, site_id: 0 })]
    #[case(AckFrame { seq: 42, site_id: 7 })]
    #[case(AckFrame { seq: u64::MAX, site_id: u32::MAX })]
    #[tokio::test]
    async fn test_ack_frame_round_trip(#[case] frame: AckFrame) {
        let encoded = frame.to_bytes();
        assert_eq!(encoded.len(), AckFrame::SERIALIZED_LEN);

        let decoded = AckFrame::read(&mut encoded.as_ref()).await.unwrap();
        assert_eq!(decoded, frame);
    }
}
