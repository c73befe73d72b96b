//! multipart/x-mixed-replace framing
//!
//! Each JPEG is sent as one part:
//!
//! ```text
//! --<boundary>\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: <n>\r\n
//! \r\n
//! <n bytes of JPEG>\r\n
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::io::{AsyncWrite, AsyncWriteExt};

const BOUNDARY_LEN: usize = 24;
const PART_TRAILER: &[u8] = b"\r\n";

/// Multipart boundary token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Boundary(String);

impl Boundary {
    /// Generate a random alphanumeric boundary
    pub fn random() -> Self {
        let token = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(BOUNDARY_LEN)
            .map(char::from)
            .collect();
        Self(token)
    }

    /// Use a fixed boundary
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The bare token
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value of the response `Content-Type` header
    pub fn content_type(&self) -> String {
        format!("multipart/x-mixed-replace; boundary={}", self.0)
    }

    /// Header block preceding a JPEG of `len` bytes
    pub fn part_header(&self, len: usize) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.0.len() + 64);
        buf.put_slice(b"--");
        buf.put_slice(self.0.as_bytes());
        buf.put_slice(b"\r\nContent-Type: image/jpeg\r\nContent-Length: ");
        buf.put_slice(len.to_string().as_bytes());
        buf.put_slice(b"\r\n\r\n");
        buf.freeze()
    }
}

impl std::fmt::Display for Boundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One complete JPEG part as a single buffer
pub fn encode_part(boundary: &Boundary, jpeg: &[u8]) -> Bytes {
    let header = boundary.part_header(jpeg.len());
    let mut buf = BytesMut::with_capacity(header.len() + jpeg.len() + PART_TRAILER.len());
    buf.put_slice(&header);
    buf.put_slice(jpeg);
    buf.put_slice(PART_TRAILER);
    buf.freeze()
}

/// Write one JPEG part and flush
///
/// Returns the number of bytes written.
pub async fn write_part<W>(writer: &mut W, boundary: &Boundary, jpeg: &[u8]) -> std::io::Result<usize>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let header = boundary.part_header(jpeg.len());
    writer.write_all(&header).await?;
    writer.write_all(jpeg).await?;
    writer.write_all(PART_TRAILER).await?;
    writer.flush().await?;

    Ok(header.len() + jpeg.len() + PART_TRAILER.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_boundary() {
        let a = Boundary::random();
        let b = Boundary::random();
        assert_eq!(a.as_str().len(), BOUNDARY_LEN);
        assert!(a.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_content_type() {
        let boundary = Boundary::new("frame");
        assert_eq!(
            boundary.content_type(),
            "multipart/x-mixed-replace; boundary=frame"
        );
    }

    #[test]
    fn test_part_header() {
        let boundary = Boundary::new("frame");
        assert_eq!(
            &boundary.part_header(1234)[..],
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 1234\r\n\r\n"
        );
    }

    #[test]
    fn test_encode_part() {
        let part = encode_part(&Boundary::new("b"), &[0xFF, 0xD8, 0xFF]);
        assert_eq!(
            &part[..],
            b"--b\r\nContent-Type: image/jpeg\r\nContent-Length: 3\r\n\r\n\xFF\xD8\xFF\r\n"
        );
    }

    #[tokio::test]
    async fn test_write_part() {
        let boundary = Boundary::new("b");
        let mut writer = tokio_test::io::Builder::new()
            .write(b"--b\r\nContent-Type: image/jpeg\r\nContent-Length: 3\r\n\r\n")
            .write(&[0xFF, 0xD8, 0xFF])
            .write(b"\r\n")
            .build();

        let written = write_part(&mut writer, &boundary, &[0xFF, 0xD8, 0xFF])
            .await
            .unwrap();
        assert_eq!(written, 57);
    }
}
