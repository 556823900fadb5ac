//! Byte copy primitive used by the relay loop
//!
//! [`copy_burst`] waits for a source to produce data, moves it into a
//! destination verbatim, and hands control back once the source hits EOF,
//! goes quiet for longer than the idle budget, or the burst limit is reached.
//! The relay runs one burst loop per direction, concurrently.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default read chunk size
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Default upper bound on bytes moved in one direction before yielding
pub const DEFAULT_MAX_BURST: u64 = 1024 * 1024;

/// Default time a burst waits for further data before yielding
pub const DEFAULT_IDLE_BUDGET: Duration = Duration::from_millis(5);

/// Limits applied to a single burst
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstLimits {
    /// Give up once the source has made no progress for this long
    pub idle_budget: Duration,
    /// Yield after this many bytes so the opposite direction is not starved
    pub max_burst: u64,
}

impl Default for BurstLimits {
    fn default() -> Self {
        Self {
            idle_budget: DEFAULT_IDLE_BUDGET,
            max_burst: DEFAULT_MAX_BURST,
        }
    }
}

/// Outcome of one burst
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Burst {
    /// Source is still open; `n` bytes were forwarded
    Forwarded(u64),
    /// Source reached EOF after `n` bytes were forwarded
    Eof(u64),
}

impl Burst {
    pub fn bytes(&self) -> u64 {
        match *self {
            Burst::Forwarded(n) | Burst::Eof(n) => n,
        }
    }
}

/// Which side of a copy failed
#[derive(Debug)]
pub enum CopyError {
    Read(io::Error),
    Write(io::Error),
}

/// Copy from `src` to `dst` until EOF, an idle stall, or the burst limit.
///
/// The first read waits as long as it takes. After that each chunk read is
/// written out in full before the next read, and the idle budget restarts
/// after every successful read, so a steadily producing source is never cut
/// off by it.
pub async fn copy_burst<R, W>(
    src: &mut R,
    dst: &mut W,
    buf: &mut [u8],
    limits: BurstLimits,
) -> Result<Burst, CopyError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut forwarded = 0u64;

    loop {
        let n = if forwarded == 0 {
            src.read(buf).await.map_err(CopyError::Read)?
        } else {
            match tokio::time::timeout(limits.idle_budget, src.read(buf)).await {
                Ok(result) => result.map_err(CopyError::Read)?,
                Err(_) => break,
            }
        };

        if n == 0 {
            dst.flush().await.map_err(CopyError::Write)?;
            return Ok(Burst::Eof(forwarded));
        }

        dst.write_all(&buf[..n]).await.map_err(CopyError::Write)?;
        forwarded += n as u64;

        if forwarded >= limits.max_burst {
            break;
        }
    }

    dst.flush().await.map_err(CopyError::Write)?;
    Ok(Burst::Forwarded(forwarded))
}
