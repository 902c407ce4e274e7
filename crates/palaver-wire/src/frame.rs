//! Line framing over blocking byte streams.
//!
//! Records are `\n`-terminated UTF-8 lines. The reader accumulates raw
//! bytes into a [`BytesMut`] and splits complete frames off the front, so
//! a single read may yield several frames and a frame may span several
//! reads.

use std::io::{self, Read, Write};

use bytes::BytesMut;

use crate::error::{WireError, WireResult};

/// Upper bound on a single frame. The largest legitimate record is a logs
/// page (4 chats of at most 280 bytes plus envelope), far below this.
pub const MAX_FRAME_BYTES: usize = 8 * 1024;

/// Incremental reader of line-framed records.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Reads the next frame, blocking until a full line arrives.
    ///
    /// Returns `Ok(None)` on clean end-of-stream. A stream that ends in
    /// the middle of a frame fails with malformed-record; a read timeout
    /// configured on the underlying socket surfaces as `WireError::Io`.
    pub fn read_frame(&mut self) -> WireResult<Option<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line = self.buf.split_to(pos + 1);
                let body = &line[..line.len() - 1];
                let text = std::str::from_utf8(body)
                    .map_err(|_| WireError::NotUtf8)?
                    .to_string();
                return Ok(Some(text));
            }
            if self.buf.len() > MAX_FRAME_BYTES {
                return Err(WireError::FrameTooLarge {
                    max: MAX_FRAME_BYTES,
                });
            }

            let mut chunk = [0u8; 4096];
            match self.inner.read(&mut chunk) {
                Ok(0) => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    return Err(WireError::malformed("stream ended mid-frame"));
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Gives back the underlying stream (any buffered partial frame is
    /// dropped).
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes one framed record and flushes it to the transport.
pub fn write_frame(w: &mut impl Write, record: &str) -> WireResult<()> {
    debug_assert!(
        !record.contains('\n'),
        "record must be a single line: {record:?}"
    );
    w.write_all(record.as_bytes())?;
    w.write_all(b"\n")?;
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn splits_multiple_frames_from_one_read() {
        let mut reader = FrameReader::new(Cursor::new(b"one\ntwo\nthree\n".to_vec()));
        assert_eq!(reader.read_frame().unwrap(), Some("one".to_string()));
        assert_eq!(reader.read_frame().unwrap(), Some("two".to_string()));
        assert_eq!(reader.read_frame().unwrap(), Some("three".to_string()));
        assert_eq!(reader.read_frame().unwrap(), None);
    }

    #[test]
    fn empty_stream_is_clean_eof() {
        let mut reader = FrameReader::new(Cursor::new(Vec::new()));
        assert_eq!(reader.read_frame().unwrap(), None);
    }

    #[test]
    fn truncated_frame_is_malformed() {
        let mut reader = FrameReader::new(Cursor::new(b"partial".to_vec()));
        assert!(matches!(
            reader.read_frame(),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let big = vec![b'x'; MAX_FRAME_BYTES + 2];
        let mut reader = FrameReader::new(Cursor::new(big));
        assert!(matches!(
            reader.read_frame(),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut wire = Vec::new();
        write_frame(&mut wire, "ream@@create").unwrap();
        write_frame(&mut wire, "@@ping").unwrap();
        let mut reader = FrameReader::new(Cursor::new(wire));
        assert_eq!(reader.read_frame().unwrap(), Some("ream@@create".to_string()));
        assert_eq!(reader.read_frame().unwrap(), Some("@@ping".to_string()));
    }
}
