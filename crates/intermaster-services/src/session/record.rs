//! Encrypted record stream: `[u32 BE length][ciphertext]`, one sealed
//! record per message.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use intermaster_core::crypto::{RecordOpener, RecordSealer, TAG_LEN};
use intermaster_core::wire::{decode_record_len, encode_record_len};

use crate::channel::ChannelError;

/// Length prefix for a record carrying `plaintext_len` bytes, or
/// `RecordTooLarge` if it would not fit. Checked before sealing so an
/// oversize message leaves the nonce counter untouched.
pub fn record_prefix(plaintext_len: usize) -> Result<[u8; 4], ChannelError> {
    Ok(encode_record_len(plaintext_len.saturating_add(TAG_LEN))?)
}

pub struct RecordWriter<W> {
    inner: W,
    sealer: RecordSealer,
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    pub fn new(inner: W, sealer: RecordSealer) -> Self {
        Self { inner, sealer }
    }

    pub async fn send(&mut self, plaintext: &[u8]) -> Result<(), ChannelError> {
        let prefix = record_prefix(plaintext.len())?;
        let sealed = self.sealer.seal(plaintext)?;
        self.inner.write_all(&prefix).await?;
        self.inner.write_all(&sealed).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Close our direction of the stream. The peer sees EOF.
    pub async fn shutdown(&mut self) -> Result<(), ChannelError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

pub struct RecordReader<R> {
    inner: R,
    opener: RecordOpener,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub fn new(inner: R, opener: RecordOpener) -> Self {
        Self { inner, opener }
    }

    /// Next record, or `None` on a clean EOF between records.
    ///
    /// Any error is fatal: the counter has either advanced past a record
    /// we could not authenticate or the stream is mid-record.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        let mut prefix = [0u8; 4];
        // EOF is clean only on a record boundary.
        match self.inner.read_u8().await {
            Ok(first) => prefix[0] = first,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        self.inner.read_exact(&mut prefix[1..]).await?;
        let len = decode_record_len(prefix)?;
        let mut sealed = vec![0u8; len];
        self.inner.read_exact(&mut sealed).await?;
        Ok(Some(self.opener.open(&sealed)?))
    }
}
