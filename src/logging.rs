// Log output with secret masking

use anyhow::{Context, Result};
use std::io::{self, Write};
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::MaskerHandle;
use crate::config::LogFormat;

/// `MakeWriter` that masks every formatted event before it reaches `inner`
#[derive(Debug, Clone)]
pub struct MaskingMakeWriter<M> {
    masker: MaskerHandle,
    inner: M,
}

impl<M> MaskingMakeWriter<M> {
    pub fn new(masker: MaskerHandle, inner: M) -> Self {
        Self { masker, inner }
    }
}

impl<'a, M> MakeWriter<'a> for MaskingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = MaskingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        MaskingWriter {
            masker: self.masker.clone(),
            inner: self.inner.make_writer(),
            buffer: Vec::new(),
        }
    }
}

/// Buffers one event and writes it masked on flush or drop
///
/// Buffering keeps a secret split across several `write` calls from slipping
/// through unmasked.
pub struct MaskingWriter<W: Write> {
    masker: MaskerHandle,
    inner: W,
    buffer: Vec<u8>,
}

impl<W: Write> MaskingWriter<W> {
    fn emit(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let masked = self.masker.mask(&String::from_utf8_lossy(&self.buffer));
        self.buffer.clear();
        self.inner.write_all(masked.as_bytes())
    }
}

impl<W: Write> Write for MaskingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit()?;
        self.inner.flush()
    }
}

impl<W: Write> Drop for MaskingWriter<W> {
    fn drop(&mut self) {
        // Nowhere left to report a failed log write
        let _ = self.emit();
    }
}

/// Install the global subscriber. `RUST_LOG` overrides `level`.
pub fn init_logging(level: &str, format: &LogFormat, masker: MaskerHandle) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = MaskingMakeWriter::new(masker, io::stderr);
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_ansi(false)
                    .with_writer(writer),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_file(true)
                    .with_line_number(true)
                    .with_writer(writer),
            )
            .try_init(),
    }
    .context("Failed to initialize logging")
}
