//! Byte-exact `multipart/x-mixed-replace` framing for the MJPEG stream.
//!
//! The response head is produced by the HTTP server with [`STREAM_CONTENT_TYPE`]; the
//! body written here starts with a boundary marker and never varies in layout. Browsers
//! and most MJPEG clients are picky about it.

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Multipart boundary token
pub const BOUNDARY_TOKEN: &str = "123456789000000000000987654321";

/// Content type of the stream response.
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=123456789000000000000987654321";

/// Boundary marker sent first and after every part.
pub const BOUNDARY: &[u8] = b"\r\n--123456789000000000000987654321\r\n";

/// Start of every part header; the decimal content length follows.
pub const PART_CONTENT_TYPE: &[u8] = b"Content-Type: image/jpeg\r\nContent-Length: ";

/// Content type of single frames.
pub const JPEG_CONTENT_TYPE: &str = "image/jpeg";

/// Content disposition of the single-frame endpoint.
pub const SNAPSHOT_DISPOSITION: &str = "inline; filename=capture.jpg";

/// Header bytes for one part carrying `len` bytes of JPEG data.
pub fn part_header(len: usize) -> Vec<u8> {
    let mut header = Vec::with_capacity(PART_CONTENT_TYPE.len() + 24);
    header.extend_from_slice(PART_CONTENT_TYPE);
    header.extend_from_slice(len.to_string().as_bytes());
    header.extend_from_slice(b"\r\n\r\n");
    header
}

/// Write the stream body preamble: the first boundary.
pub async fn write_preamble<W>(writer: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(BOUNDARY).await?;
    writer.flush().await
}

/// Write one part: header, raw frame bytes, boundary.
pub async fn write_part<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&part_header(frame.len())).await?;
    writer.write_all(frame).await?;
    writer.write_all(BOUNDARY).await?;
    writer.flush().await
}

/// Incremental parser for the client side of the stream.
///
/// Feed it the stream body; it yields each part's payload. Used by
/// tests and the framing benchmark to check what a real client would see.
#[derive(Debug, Default)]
pub struct PartReader {
    buffer: Vec<u8>,
}

impl PartReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Strip the leading boundary, if fully buffered.
    pub fn take_preamble(&mut self) -> bool {
        if self.buffer.len() < BOUNDARY.len() {
            return false;
        }
        let matches = self.buffer.starts_with(BOUNDARY);
        if matches {
            self.buffer.drain(..BOUNDARY.len());
        }
        matches
    }

    /// Next complete part payload, or `Ok(None)` when more bytes are needed.
    ///
    /// Returns an error message when the buffered bytes are not a well-formed part.
    pub fn next_part(&mut self) -> Result<Option<Vec<u8>>, String> {
        if self.buffer.len() < PART_CONTENT_TYPE.len() {
            return Ok(None);
        }
        if !self.buffer.starts_with(PART_CONTENT_TYPE) {
            return Err("part does not start with the JPEG content type".to_string());
        }

        let rest = &self.buffer[PART_CONTENT_TYPE.len()..];
        let Some(end) = rest.windows(4).position(|w| w == b"\r\n\r\n") else {
            return Ok(None);
        };
        let len: usize = std::str::from_utf8(&rest[..end])
            .map_err(|e| e.to_string())?
            .parse()
            .map_err(|e: std::num::ParseIntError| e.to_string())?;

        let body_start = PART_CONTENT_TYPE.len() + end + 4;
        let part_end = body_start + len + BOUNDARY.len();
        if self.buffer.len() < part_end {
            return Ok(None);
        }
        if &self.buffer[body_start + len..part_end] != BOUNDARY {
            return Err(format!("part of {len} bytes is not followed by the boundary"));
        }

        let payload = self.buffer[body_start..body_start + len].to_vec();
        self.buffer.drain(..part_end);
        Ok(Some(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_constants_are_byte_exact() {
        assert_eq!(STREAM_CONTENT_TYPE, format!("multipart/x-mixed-replace; boundary={BOUNDARY_TOKEN}"));
        assert_eq!(BOUNDARY, format!("\r\n--{BOUNDARY_TOKEN}\r\n").as_bytes());
        assert_eq!(
            part_header(1234),
            b"Content-Type: image/jpeg\r\nContent-Length: 1234\r\n\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn written_parts_parse_back() {
        let mut wire = Vec::new();
        write_preamble(&mut wire).await.unwrap();
        write_part(&mut wire, b"\xFF\xD8abc\xFF\xD9").await.unwrap();
        write_part(&mut wire, b"").await.unwrap();

        let mut reader = PartReader::new();
        // Deliver in awkward chunks
        for chunk in wire.chunks(7) {
            reader.push(chunk);
        }
        assert!(reader.take_preamble());
        assert_eq!(reader.next_part().unwrap().unwrap(), b"\xFF\xD8abc\xFF\xD9".to_vec());
        assert_eq!(reader.next_part().unwrap().unwrap(), Vec::<u8>::new());
        assert_eq!(reader.next_part().unwrap(), None);
    }

    #[test]
    fn truncated_part_waits_for_more_bytes() {
        let mut reader = PartReader::new();
        reader.push(&part_header(10));
        reader.push(b"12345");
        assert_eq!(reader.next_part().unwrap(), None);
        reader.push(b"67890");
        reader.push(BOUNDARY);
        assert_eq!(reader.next_part().unwrap().unwrap(), b"1234567890".to_vec());
    }

    #[test]
    fn wrong_length_is_rejected() {
        let mut reader = PartReader::new();
        reader.push(&part_header(3));
        reader.push(b"abcd");
        reader.push(BOUNDARY);
        assert!(reader.next_part().is_err());
    }
}
