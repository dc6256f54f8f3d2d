//! Newline-delimited JSON framing shared by the executor and its client.

use std::io;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum line size in bytes (1 MB is far more than any request needs).
pub const MAX_LINE_SIZE: usize = 1024 * 1024;

/// Read a line with a maximum size limit to prevent memory DoS.
///
/// Returns the number of bytes read (0 means EOF).
/// Returns an error if the line exceeds max_size before finding a newline.
pub async fn read_line_bounded<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut String,
    max_size: usize,
) -> io::Result<usize> {
    let mut total = 0;
    let mut bytes = Vec::new();

    loop {
        let available = reader.fill_buf().await?;

        if available.is_empty() {
            break;
        }

        let newline_pos = available.iter().position(|&b| b == b'\n');
        let bytes_to_consume = newline_pos.map(|p| p + 1).unwrap_or(available.len());

        if total + bytes_to_consume > max_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line too large: exceeded {} byte limit", max_size),
            ));
        }

        // Validate UTF-8 once at the end, chunks may split a character.
        bytes.extend_from_slice(&available[..bytes_to_consume]);
        total += bytes_to_consume;
        reader.consume(bytes_to_consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let line = std::str::from_utf8(&bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    buf.push_str(line);
    Ok(total)
}

/// Serialize `value` as one JSON line and flush it.
pub async fn write_line<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut json = serde_json::to_vec(value)?;
    json.push(b'\n');
    writer.write_all(&json).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_read_line_bounded_handles_utf8_chunks() {
        let data = "hello 你好\n".as_bytes().to_vec();
        let cursor = std::io::Cursor::new(data);
        let mut reader = BufReader::with_capacity(1, cursor);
        let mut buf = String::new();

        let bytes = read_line_bounded(&mut reader, &mut buf, 1024)
            .await
            .expect("read line");

        assert!(bytes > 0);
        assert_eq!(buf, "hello 你好\n");
    }

    #[tokio::test]
    async fn test_read_line_bounded_rejects_oversized_line() {
        let data = vec![b'x'; 64];
        let mut reader = BufReader::new(std::io::Cursor::new(data));
        let mut buf = String::new();

        let err = read_line_bounded(&mut reader, &mut buf, 16)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_read_line_bounded_eof() {
        let mut reader = BufReader::new(std::io::Cursor::new(Vec::new()));
        let mut buf = String::new();
        assert_eq!(read_line_bounded(&mut reader, &mut buf, 16).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_line_appends_newline() {
        let mut out = Vec::new();
        write_line(&mut out, &serde_json::json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(out, b"{\"a\":1}\n");
    }
}
