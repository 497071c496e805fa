// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Framing for VM bundles.
//!
//! Frames are defined by a 5-byte header consisting of a 32-bit length
//! (unsigned little endian) followed by a tag byte indicating the frame
//! type, and then the frame data. The length field includes the header.
//!
//! The framing layer checks only that each frame is well formed on its own.
//! Frame order, and agreement between extent headers and the data that
//! follows them, are checked by the bundle reader.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::convert::TryFrom;
use thiserror::Error;
use tokio_util::codec;

/// Leading bytes of every bundle header frame.
pub const MAGIC: &[u8; 8] = b"VMBUNDLE";

const HEADER_LEN: usize = 5;

/// Largest frame accepted, header included.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("couldn't decode frame type ({0})")]
    InvalidFrameType(u8),

    #[error("unexpected frame length {1} for type {0:?}")]
    UnexpectedFrameLen(FrameType, usize),

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),

    #[error("header does not carry the bundle magic")]
    BadMagic,

    #[error("non-UTF8 string: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One frame of a bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Opens the bundle.
    Header { version: u32, flags: u8 },
    /// The VM record, serialized as JSON.
    Record(String),
    /// Starts a storage extent; the payload is a JSON extent reference.
    ExtentBegin(String),
    ExtentData(Bytes),
    /// Ends the current extent, giving the number of data bytes sent.
    ExtentEnd(u64),
    /// Closes the bundle, giving the number of extents sent.
    End(u32),
}

/// Tags used on the wire to identify frame types. Kept in bijection with
/// [`Frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Header,
    Record,
    ExtentBegin,
    ExtentData,
    ExtentEnd,
    End,
}

impl From<&Frame> for FrameType {
    fn from(f: &Frame) -> FrameType {
        match f {
            Frame::Header { .. } => FrameType::Header,
            Frame::Record(_) => FrameType::Record,
            Frame::ExtentBegin(_) => FrameType::ExtentBegin,
            Frame::ExtentData(_) => FrameType::ExtentData,
            Frame::ExtentEnd(_) => FrameType::ExtentEnd,
            Frame::End(_) => FrameType::End,
        }
    }
}

/// Encodes and decodes bundle frames.
#[derive(Debug, Default)]
pub struct BundleFramer {}

impl BundleFramer {
    pub fn new() -> BundleFramer {
        BundleFramer::default()
    }

    /// Writes the header at the start of the frame, reserving room for the
    /// whole frame in `dst`.
    fn put_header(
        &mut self,
        tag: FrameType,
        len: usize,
        dst: &mut BytesMut,
    ) -> Result<(), FrameError> {
        let len = len + HEADER_LEN;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(len));
        }
        dst.reserve(len);
        dst.put_u32_le(len as u32);
        dst.put_u8(tag.into());
        Ok(())
    }
}

impl codec::Encoder<Frame> for BundleFramer {
    type Error = FrameError;

    fn encode(&mut self, f: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let tag = (&f).into();
        match f {
            Frame::Header { version, flags } => {
                self.put_header(tag, MAGIC.len() + 4 + 1, dst)?;
                dst.put_slice(MAGIC);
                dst.put_u32_le(version);
                dst.put_u8(flags);
            }
            Frame::Record(s) | Frame::ExtentBegin(s) => {
                self.put_header(tag, s.len(), dst)?;
                dst.put_slice(s.as_bytes());
            }
            Frame::ExtentData(data) => {
                self.put_header(tag, data.len(), dst)?;
                dst.put_slice(&data);
            }
            Frame::ExtentEnd(n) => {
                self.put_header(tag, 8, dst)?;
                dst.put_u64_le(n);
            }
            Frame::End(n) => {
                self.put_header(tag, 4, dst)?;
                dst.put_u32_le(n);
            }
        }
        Ok(())
    }
}

impl codec::Decoder for BundleFramer {
    type Item = Frame;
    type Error = FrameError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        // If the tag byte is invalid, don't bother looking at the frame size.
        let tag = FrameType::try_from(src[4])
            .map_err(|_| FrameError::InvalidFrameType(src[4]))?;
        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len < HEADER_LEN {
            return Err(FrameError::UnexpectedFrameLen(tag, len));
        }
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(len));
        }
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let mut body = src.split_to(len - HEADER_LEN);
        let expect_len = |want: usize| {
            if body.len() == want {
                Ok(())
            } else {
                Err(FrameError::UnexpectedFrameLen(tag, len))
            }
        };
        let frame = match tag {
            FrameType::Header => {
                expect_len(MAGIC.len() + 4 + 1)?;
                if &body[..MAGIC.len()] != MAGIC {
                    return Err(FrameError::BadMagic);
                }
                body.advance(MAGIC.len());
                let version = body.get_u32_le();
                let flags = body.get_u8();
                Frame::Header { version, flags }
            }
            FrameType::Record => {
                Frame::Record(std::str::from_utf8(&body)?.to_string())
            }
            FrameType::ExtentBegin => {
                Frame::ExtentBegin(std::str::from_utf8(&body)?.to_string())
            }
            FrameType::ExtentData => Frame::ExtentData(body.freeze()),
            FrameType::ExtentEnd => {
                expect_len(8)?;
                Frame::ExtentEnd(body.get_u64_le())
            }
            FrameType::End => {
                expect_len(4)?;
                Frame::End(body.get_u32_le())
            }
        };
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod bundle_framer_tests {
    use super::*;
    use tokio_util::codec::{Decoder, Encoder};

    fn encode(f: Frame) -> BytesMut {
        let mut bytes = BytesMut::new();
        BundleFramer::new().encode(f, &mut bytes).unwrap();
        bytes
    }

    fn decode(bytes: &[u8]) -> Result<Option<Frame>, FrameError> {
        let mut src = BytesMut::from(bytes);
        BundleFramer::new().decode(&mut src)
    }

    #[test]
    fn put_header() {
        let mut bytes = BytesMut::new();
        let mut framer = BundleFramer {};
        framer.put_header(FrameType::Header, 0, &mut bytes).unwrap();
        assert_eq!(&bytes[..], &[5, 0, 0, 0, 0]);
    }

    #[test]
    fn put_header_nonzero_tag() {
        let mut bytes = BytesMut::new();
        let mut framer = BundleFramer {};
        framer.put_header(FrameType::End, 4, &mut bytes).unwrap();
        assert_eq!(&bytes[..], &[9, 0, 0, 0, FrameType::End as u8]);
    }

    #[test]
    fn encode_header() {
        let bytes = encode(Frame::Header { version: 1, flags: 1 });
        assert_eq!(&bytes[..5], &[18, 0, 0, 0, FrameType::Header as u8]);
        assert_eq!(&bytes[5..13], MAGIC);
        assert_eq!(&bytes[13..], &[1, 0, 0, 0, 1]);
    }

    #[test]
    fn encode_record() {
        let bytes = encode(Frame::Record(r#"{"ram":256}"#.to_string()));
        assert_eq!(&bytes[..5], &[16, 0, 0, 0, FrameType::Record as u8]);
        assert_eq!(&bytes[5..], br#"{"ram":256}"#);
    }

    #[test]
    fn encode_extent_end() {
        let bytes = encode(Frame::ExtentEnd(258));
        assert_eq!(
            &bytes[..],
            &[13, 0, 0, 0, FrameType::ExtentEnd as u8, 2, 1, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn decode_each_frame_type() {
        for frame in [
            Frame::Header { version: 1, flags: 0 },
            Frame::Record("{}".to_string()),
            Frame::ExtentBegin(r#"{"name":"disk0","size":3}"#.to_string()),
            Frame::ExtentData(Bytes::from_static(b"abc")),
            Frame::ExtentData(Bytes::new()),
            Frame::ExtentEnd(3),
            Frame::End(1),
        ] {
            let bytes = encode(frame.clone());
            assert_eq!(decode(&bytes).unwrap(), Some(frame));
        }
    }

    #[test]
    fn decode_waits_for_whole_frame() {
        let bytes = encode(Frame::End(7));
        assert_eq!(decode(&bytes[..3]).unwrap(), None);
        assert_eq!(decode(&bytes[..8]).unwrap(), None);
    }

    #[test]
    fn decode_consumes_one_frame_at_a_time() {
        let mut src = encode(Frame::ExtentEnd(1));
        src.extend_from_slice(&encode(Frame::End(2)));
        let mut framer = BundleFramer::new();
        assert_eq!(framer.decode(&mut src).unwrap(), Some(Frame::ExtentEnd(1)));
        assert_eq!(framer.decode(&mut src).unwrap(), Some(Frame::End(2)));
        assert!(src.is_empty());
    }

    #[test]
    fn decode_bad_tag_fails() {
        let err = decode(&[5, 0, 0, 0, 0xee]).unwrap_err();
        assert!(matches!(err, FrameError::InvalidFrameType(0xee)));
    }

    #[test]
    fn decode_short_length_fails() {
        let err = decode(&[4, 0, 0, 0, FrameType::End as u8]).unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedFrameLen(FrameType::End, 4)));
    }

    #[test]
    fn decode_wrong_fixed_size_fails() {
        let err = decode(&[8, 0, 0, 0, FrameType::End as u8, 1, 0, 0]).unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedFrameLen(FrameType::End, 8)));
    }

    #[test]
    fn decode_bad_magic_fails() {
        let mut bytes = encode(Frame::Header { version: 1, flags: 0 });
        bytes[5] = b'X';
        assert!(matches!(decode(&bytes).unwrap_err(), FrameError::BadMagic));
    }

    #[test]
    fn decode_oversized_frame_fails() {
        let len = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
        let err = decode(&[len[0], len[1], len[2], len[3], FrameType::ExtentData as u8])
            .unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }

    #[test]
    fn decode_non_utf8_record_fails() {
        let err = decode(&[7, 0, 0, 0, FrameType::Record as u8, 0xff, 0xfe])
            .unwrap_err();
        assert!(matches!(err, FrameError::Utf8(_)));
    }
}
