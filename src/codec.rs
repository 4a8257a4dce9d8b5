//! JSON-RPC framing codec.
//!
//! LSP frames are `Content-Length: N\r\n\r\n{json}` over the server's stdio.
//! [`FrameReader`] and [`FrameWriter`] read and write framed messages
//! asynchronously; [`encode_frame`] builds a frame in memory.
//!
//! Emitted JSON carries its object keys in lexicographic order at every
//! nesting level (serde_json's default map representation); some servers
//! reject frames otherwise. The `preserve_order` feature must stay off.

use anyhow::{Context, Result, anyhow, bail, ensure};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Frame size cap (4 MiB) against unbounded allocation.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Reads framed messages from an async byte stream.
///
/// Buffering makes the reader indifferent to how the bytes arrive: a frame
/// split across many reads and several frames in one read both parse the
/// same way.
pub struct FrameReader<R> {
    input: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input: BufReader::new(input),
        }
    }

    /// Read the next frame.
    ///
    /// `Ok(None)` means EOF at a frame boundary (clean shutdown). Malformed
    /// headers, truncated bodies, oversized frames, and bodies that are not
    /// valid JSON are errors.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>> {
        let Some(length) = self.read_content_length().await? else {
            return Ok(None);
        };
        ensure!(
            length <= MAX_FRAME_BYTES,
            "refusing {length}-byte frame (cap is {MAX_FRAME_BYTES})"
        );

        let mut body = vec![0u8; length];
        self.input
            .read_exact(&mut body)
            .await
            .context("frame body truncated")?;
        let value = serde_json::from_slice(&body).context("frame body is not valid JSON")?;
        Ok(Some(value))
    }

    /// Consume one header block and return its `Content-Length`.
    ///
    /// `None` on EOF before any header byte. Header names are matched
    /// exactly; whitespace around the colon is trimmed; headers other than
    /// `Content-Length` are tolerated and dropped.
    async fn read_content_length(&mut self) -> Result<Option<usize>> {
        let mut length: Option<usize> = None;
        let mut line = String::new();
        let mut lines_seen = 0usize;

        loop {
            line.clear();
            let n = self
                .input
                .read_line(&mut line)
                .await
                .context("reading frame header")?;
            if n == 0 {
                // EOF is clean only between frames. A partial header block
                // (even one carrying no Content-Length yet) is an error.
                if lines_seen == 0 {
                    return Ok(None);
                }
                bail!("stream ended inside a header block");
            }
            lines_seen += 1;

            let header = line.trim();
            if header.is_empty() {
                break;
            }
            let (name, value) = header
                .split_once(':')
                .ok_or_else(|| anyhow!("header line without a colon: {header:?}"))?;
            if name.trim_end() == "Content-Length" {
                length = Some(
                    value
                        .trim()
                        .parse()
                        .context("unparseable Content-Length value")?,
                );
            }
        }

        length
            .map(Some)
            .ok_or_else(|| anyhow!("header block has no Content-Length"))
    }
}

/// Writes framed messages to an async byte stream.
pub struct FrameWriter<W> {
    output: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(output: W) -> Self {
        Self { output }
    }

    /// Write one frame and flush it.
    pub async fn write_frame(&mut self, message: &serde_json::Value) -> Result<()> {
        let frame = encode_frame(message)?;
        self.output
            .write_all(&frame)
            .await
            .context("writing frame")?;
        self.output.flush().await.context("flushing frame")?;
        Ok(())
    }
}

/// Serialize `message` into a complete `Content-Length`-prefixed frame.
pub fn encode_frame(message: &serde_json::Value) -> Result<Vec<u8>> {
    let body = serde_json::to_string(message).context("serializing frame body")?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(body.as_bytes());
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    async fn read_all(bytes: &[u8]) -> Vec<serde_json::Value> {
        let mut reader = FrameReader::new(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = reader.read_frame().await.unwrap() {
            frames.push(frame);
        }
        frames
    }

    async fn read_one(bytes: &[u8]) -> Result<Option<serde_json::Value>> {
        FrameReader::new(bytes).read_frame().await
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let message = json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "textDocument/didOpen",
            "params": {"textDocument": {"uri": "file:///project/main.cc"}},
        });

        let mut wire = Vec::new();
        FrameWriter::new(&mut wire)
            .write_frame(&message)
            .await
            .unwrap();

        assert_eq!(read_all(&wire).await, vec![message]);
    }

    #[tokio::test]
    async fn test_several_frames_in_one_buffer() {
        let mut wire = Vec::new();
        for id in 0..3 {
            wire.extend_from_slice(&encode_frame(&json!({"id": id})).unwrap());
        }
        let frames = read_all(&wire).await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2]["id"], 2);
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        // Header plus a partial body first; the remainder later.
        let (near, mut far) = tokio::io::duplex(64);

        far.write_all(b"Content-Length: 10\n\n{\"abc\":")
            .await
            .unwrap();
        let parse = tokio::spawn(async move {
            let mut reader = FrameReader::new(near);
            reader.read_frame().await
        });
        tokio::task::yield_now().await;
        far.write_all(b"\"\"}").await.unwrap();

        let frame = parse.await.unwrap().unwrap().unwrap();
        assert_eq!(frame, json!({"abc": ""}));
    }

    #[tokio::test]
    async fn test_empty_stream_is_clean_eof() {
        assert!(read_one(b"").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_content_length_header() {
        assert!(read_one(b"Content-NOTLENGTH: 10\r\n\r\n{}").await.is_err());
    }

    #[tokio::test]
    async fn test_header_name_match_is_case_sensitive() {
        let wire = b"content-length: 2\r\n\r\n{}";
        assert!(read_one(wire).await.is_err());
    }

    #[tokio::test]
    async fn test_whitespace_around_colon_is_trimmed() {
        let wire = b"Content-Length :  2\r\n\r\n{}";
        let frame = read_one(wire).await.unwrap().unwrap();
        assert_eq!(frame, json!({}));
    }

    #[tokio::test]
    async fn test_unknown_headers_are_dropped() {
        let wire =
            b"Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nContent-Length: 2\r\n\r\n{}";
        let frame = read_one(wire).await.unwrap().unwrap();
        assert_eq!(frame, json!({}));
    }

    #[tokio::test]
    async fn test_header_without_colon_is_rejected() {
        assert!(read_one(b"Content-Length 2\r\n\r\n{}").await.is_err());
    }

    #[tokio::test]
    async fn test_eof_inside_header_block() {
        // A started header block must finish; EOF here is not clean even
        // though no Content-Length was parsed yet.
        assert!(read_one(b"Content-Type: application/json\r\n").await.is_err());
        assert!(read_one(b"Content-Length: 10\r\n").await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_body() {
        assert!(read_one(b"Content-Length: 100\r\n\r\nhello").await.is_err());
    }

    #[tokio::test]
    async fn test_body_must_be_json() {
        assert!(read_one(b"Content-Length: 9\r\n\r\nnot json!").await.is_err());
    }

    #[tokio::test]
    async fn test_unparseable_length_value() {
        assert!(read_one(b"Content-Length: ten\r\n\r\n").await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_refused() {
        let wire = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        assert!(read_one(wire.as_bytes()).await.is_err());
    }

    #[tokio::test]
    async fn test_length_counts_bytes_not_chars() {
        // "é" is two bytes in UTF-8.
        let body = r#"{"k":"é"}"#;
        assert_eq!(body.len(), 10);
        let wire = format!("Content-Length: 10\r\n\r\n{body}");
        let frame = read_one(wire.as_bytes()).await.unwrap().unwrap();
        assert_eq!(frame["k"], "é");
    }

    #[test]
    fn test_encode_sorts_keys_at_every_level() {
        let frame = encode_frame(&json!({
            "zeta": {"b": 1, "a": 2},
            "alpha": 3,
        }))
        .unwrap();
        let text = String::from_utf8(frame).unwrap();
        assert!(text.ends_with(r#"{"alpha":3,"zeta":{"a":2,"b":1}}"#));
    }

    #[test]
    fn test_encode_header_counts_bytes() {
        let frame = encode_frame(&json!({"k": "é"})).unwrap();
        let text = String::from_utf8(frame).unwrap();
        assert!(text.starts_with("Content-Length: 10\r\n\r\n"));
    }
}
