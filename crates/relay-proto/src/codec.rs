// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Line-delimited JSON envelope framing.
//!
//! Each envelope is terminated by `\n`; readers buffer partial lines
//! across reads. A frame exceeding the configured cap is rejected before
//! the delimiter is ever found, so a chatty or malicious peer cannot grow
//! the buffer unboundedly while we wait for a newline.

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::Envelope;

/// Reads newline-delimited JSON envelopes off an async byte stream.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    cap: usize,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, cap: usize) -> Self {
        Self { inner: BufReader::new(inner), cap, buf: Vec::new() }
    }

    /// Read and parse the next envelope, or `Ok(None)` on clean EOF.
    ///
    /// A malformed frame or a version mismatch is reported as `Err`; the
    /// caller is responsible for turning that into a PROTOCOL ERROR
    /// envelope and closing the connection.
    pub async fn next_envelope(&mut self) -> anyhow::Result<Option<Envelope>> {
        let Some(line) = self.next_line().await? else {
            return Ok(None);
        };
        let env: Envelope =
            serde_json::from_slice(&line).context("malformed envelope: not valid JSON")?;
        if env.version != crate::PROTOCOL_VERSION {
            bail!(
                "protocol version mismatch: peer={}, expected={}",
                env.version,
                crate::PROTOCOL_VERSION
            );
        }
        Ok(Some(env))
    }

    /// Read one `\n`-terminated line, excluding the delimiter, or `None`
    /// on EOF before any bytes of a new line were read.
    ///
    /// Reads in chunks via `fill_buf`/`consume` rather than byte-at-a-time,
    /// bailing as soon as accumulated bytes exceed `cap` without waiting
    /// for the delimiter to ever show up.
    async fn next_line(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        self.buf.clear();
        loop {
            let available = self.inner.fill_buf().await.context("reading frame")?;
            if available.is_empty() {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                bail!("connection closed mid-frame");
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.buf.extend_from_slice(&available[..pos]);
                    self.inner.consume(pos + 1);
                    if self.buf.len() > self.cap {
                        bail!("frame exceeds {} byte cap", self.cap);
                    }
                    return Ok(Some(std::mem::take(&mut self.buf)));
                }
                None => {
                    let n = available.len();
                    self.buf.extend_from_slice(available);
                    self.inner.consume(n);
                    if self.buf.len() > self.cap {
                        bail!("frame exceeds {} byte cap", self.cap);
                    }
                }
            }
        }
    }
}

/// Writes newline-delimited JSON envelopes to an async byte stream.
///
/// The envelope stream on a Connection is owned
/// exclusively by the Connection task; this writer has no internal
/// locking because callers never share it across tasks.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_envelope(&mut self, env: &Envelope) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(env).context("serializing envelope")?;
        line.push(b'\n');
        self.inner.write_all(&line).await.context("writing frame")?;
        self.inner.flush().await.context("flushing frame")?;
        Ok(())
    }
}

/// Generic line-delimited JSON read, shared by the daemon envelope stream
/// and the per-agent control socket: same framing
/// discipline as `FrameReader`, parameterized over the wire type so the
/// control protocol doesn't need its own copy of the cap/lookup logic.
pub async fn read_json_frame<R, T>(
    reader: &mut BufReader<R>,
    buf: &mut Vec<u8>,
    cap: usize,
) -> anyhow::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    buf.clear();
    loop {
        let available = reader.fill_buf().await.context("reading frame")?;
        if available.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            bail!("connection closed mid-frame");
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                buf.extend_from_slice(&available[..pos]);
                reader.consume(pos + 1);
                if buf.len() > cap {
                    bail!("frame exceeds {cap} byte cap");
                }
                let value = serde_json::from_slice(buf).context("malformed frame: not valid JSON")?;
                return Ok(Some(value));
            }
            None => {
                let n = available.len();
                buf.extend_from_slice(available);
                reader.consume(n);
                if buf.len() > cap {
                    bail!("frame exceeds {cap} byte cap");
                }
            }
        }
    }
}

/// Generic line-delimited JSON write, the mirror of [`read_json_frame`].
pub async fn write_json_frame<W, T>(writer: &mut W, value: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let mut line = serde_json::to_vec(value).context("serializing frame")?;
    line.push(b'\n');
    writer.write_all(&line).await.context("writing frame")?;
    writer.flush().await.context("flushing frame")?;
    Ok(())
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
