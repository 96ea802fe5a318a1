//! Size-bounded request/response buffering with transparent memory-to-disk
//! spill, plus a rewindable variant that captures an upstream body so it can
//! be replayed for reproxy.

use crate::error::ProxyError;
use bytes::{Bytes, BytesMut};
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

#[derive(Debug, Clone, Copy)]
pub struct BufferConfig {
    /// Total byte cap across memory + disk. 0 = unlimited.
    pub max_bytes: u64,
    /// Memory cap before spilling to a temp file.
    pub max_mem_bytes: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_bytes: 0,
            max_mem_bytes: 64 * 1024,
        }
    }
}

/// Exclusively owned by one writer until the first read. Contents are the
/// memory region followed by an optional disk spill file, in write order.
/// Once a read has begun, no further writes are accepted.
pub struct Buffer {
    config: BufferConfig,
    mem: BytesMut,
    spill_path: Option<PathBuf>,
    spill_file: Option<File>,
    total_len: u64,
    overflow: bool,
    read_started: bool,
    pos: u64,
}

impl Buffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            mem: BytesMut::new(),
            spill_path: None,
            spill_file: None,
            total_len: 0,
            overflow: false,
            read_started: false,
            pos: 0,
        }
    }

    pub fn overflowed(&self) -> bool {
        self.overflow
    }

    pub fn len(&self) -> u64 {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    /// Appends `bytes`. Fails with `WriteAfterRead` once reading has begun,
    /// or `MaxExceeded` (latching the overflow flag) if the write would push
    /// the total past `max_bytes`. A rejected write consumes nothing.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), ProxyError> {
        if self.read_started {
            return Err(ProxyError::WriteAfterRead);
        }

        let incoming = bytes.len() as u64;
        if self.config.max_bytes > 0 && self.total_len + incoming > self.config.max_bytes {
            self.overflow = true;
            return Err(ProxyError::MaxExceeded);
        }

        let mem_room = self.config.max_mem_bytes.saturating_sub(self.mem.len() as u64);
        if incoming <= mem_room {
            self.mem.extend_from_slice(bytes);
        } else {
            let split = mem_room as usize;
            self.mem.extend_from_slice(&bytes[..split]);
            self.ensure_spill()
                .await
                .map_err(|e| ProxyError::Internal(e.to_string()))?;
            self.spill_file
                .as_mut()
                .expect("spill just ensured")
                .write_all(&bytes[split..])
                .await
                .map_err(|e| ProxyError::Internal(e.to_string()))?;
        }

        self.total_len += incoming;
        Ok(())
    }

    async fn ensure_spill(&mut self) -> std::io::Result<()> {
        if self.spill_file.is_some() {
            return Ok(());
        }
        let path = std::env::temp_dir().join(format!(
            "relayd-buffer-{}-{:x}.tmp",
            std::process::id(),
            rand::random::<u64>()
        ));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        self.spill_path = Some(path);
        self.spill_file = Some(file);
        Ok(())
    }

    /// Begins the read phase: seeks the spill file to 0 and latches
    /// `read_started`, after which writes are rejected.
    async fn start_read(&mut self) -> std::io::Result<()> {
        if !self.read_started {
            self.read_started = true;
            if let Some(f) = self.spill_file.as_mut() {
                f.seek(SeekFrom::Start(0)).await?;
            }
        }
        Ok(())
    }

    /// Resets the read cursor to the start. Re-reads after a rewind produce
    /// bytewise-identical output to the first pass.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Reads up to `buf.len()` bytes, returning the number read (0 at EOF).
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.start_read().await?;
        if buf.is_empty() {
            return Ok(0);
        }

        let mem_len = self.mem.len() as u64;
        if self.pos < mem_len {
            let start = self.pos as usize;
            let n = buf.len().min(self.mem.len() - start);
            buf[..n].copy_from_slice(&self.mem[start..start + n]);
            self.pos += n as u64;
            return Ok(n);
        }

        let Some(file) = self.spill_file.as_mut() else {
            return Ok(0);
        };
        let file_offset = self.pos - mem_len;
        file.seek(SeekFrom::Start(file_offset)).await?;
        let n = file.read(buf).await?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Reads everything from the current cursor to the end.
    pub async fn read_to_end(&mut self) -> std::io::Result<Bytes> {
        let mut out = BytesMut::new();
        let mut chunk = [0u8; 8192];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(out.freeze())
    }

    /// Idempotent. Removes the spill file, if any.
    pub async fn close(&mut self) {
        self.spill_file = None;
        if let Some(path) = self.spill_path.take() {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(path) = self.spill_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Wraps an upstream body so its bytes can be captured once and replayed.
/// This is the mechanism that lets the reproxy middleware retry a POST body
/// against a second target.
pub struct Rewindable {
    buffer: Buffer,
    captured: bool,
}

impl Rewindable {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            buffer: Buffer::new(config),
            captured: false,
        }
    }

    /// First pass: drains `body` fully, writing every chunk into the
    /// internal buffer as it is read, and returns the captured bytes.
    pub async fn capture<B>(&mut self, mut body: B) -> Result<Bytes, ProxyError>
    where
        B: http_body::Body<Data = Bytes> + Unpin,
        B::Error: std::fmt::Display,
    {
        use http_body_util::BodyExt;

        let mut out = BytesMut::new();
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| ProxyError::BadGateway(e.to_string()))?;
            if let Some(data) = frame.data_ref() {
                self.buffer.write(data).await?;
                out.extend_from_slice(data);
            }
        }
        self.captured = true;
        Ok(out.freeze())
    }

    /// Replays the exact bytes captured on the first pass.
    pub async fn rewind_bytes(&mut self) -> Result<Bytes, ProxyError> {
        if !self.captured {
            return Err(ProxyError::Internal("rewind before capture".into()));
        }
        self.buffer.rewind();
        self.buffer
            .read_to_end()
            .await
            .map_err(|e| ProxyError::Internal(e.to_string()))
    }

    pub async fn dispose(&mut self) {
        self.buffer.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let mut buf = Buffer::new(BufferConfig {
            max_bytes: 0,
            max_mem_bytes: 1024,
        });
        buf.write(b"hello world").await.unwrap();
        let out = buf.read_to_end().await.unwrap();
        assert_eq!(&out[..], b"hello world");
    }

    #[tokio::test]
    async fn spills_past_mem_cap() {
        let mut buf = Buffer::new(BufferConfig {
            max_bytes: 0,
            max_mem_bytes: 4,
        });
        buf.write(b"hello world").await.unwrap();
        assert!(buf.spill_file.is_some());
        let out = buf.read_to_end().await.unwrap();
        assert_eq!(&out[..], b"hello world");
    }

    #[tokio::test]
    async fn rewind_reproduces_identical_bytes() {
        let mut buf = Buffer::new(BufferConfig {
            max_bytes: 0,
            max_mem_bytes: 2,
        });
        buf.write(b"abcdefgh").await.unwrap();
        let first = buf.read_to_end().await.unwrap();
        buf.rewind();
        let second = buf.read_to_end().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn write_after_read_fails() {
        let mut buf = Buffer::new(BufferConfig::default());
        buf.write(b"x").await.unwrap();
        let _ = buf.read_to_end().await.unwrap();
        let err = buf.write(b"y").await.unwrap_err();
        assert!(matches!(err, ProxyError::WriteAfterRead));
    }

    #[tokio::test]
    async fn max_exceeded_latches_overflow_and_rejects() {
        let mut buf = Buffer::new(BufferConfig {
            max_bytes: 8,
            max_mem_bytes: 4,
        });
        buf.write(b"hello").await.unwrap();
        let err = buf
            .write(b"this request body is much too large")
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::MaxExceeded));
        assert!(buf.overflowed());
        assert_eq!(buf.len(), 5);
    }

    #[tokio::test]
    async fn rewindable_replays_captured_body() {
        use http_body_util::Full;
        let body = Full::new(Bytes::from_static(b"test body"));
        let mut rw = Rewindable::new(BufferConfig::default());
        let first = rw.capture(body).await.unwrap();
        assert_eq!(&first[..], b"test body");
        let replayed = rw.rewind_bytes().await.unwrap();
        assert_eq!(first, replayed);
    }
}
