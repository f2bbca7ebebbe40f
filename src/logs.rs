//! Per-process log files under `logs/<name>.log`.

use std::io::{self, SeekFrom};
use std::path::Path;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub const FOLLOW_INTERVAL: Duration = Duration::from_millis(250);

/// Copy the whole file to `out` once.
pub async fn dump<W>(path: &Path, out: &mut W) -> io::Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut file = File::open(path).await?;
    let copied = tokio::io::copy(&mut file, out).await?;
    out.flush().await?;
    Ok(copied)
}

/// Stream the file to `out` until `cancel` fires, picking up appended bytes.
///
/// A file that shrinks was truncated by a restart; reading starts over from
/// the beginning.
pub async fn follow<W>(
    path: &Path,
    out: &mut W,
    cancel: &CancellationToken,
    interval: Duration,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut file = File::open(path).await?;
    let mut offset = tokio::io::copy(&mut file, out).await?;
    out.flush().await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(interval) => {}
        }

        let len = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            // Removed by a teardown; nothing more will arrive.
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        if len < offset {
            file.seek(SeekFrom::Start(0)).await?;
            offset = 0;
        }
        if len > offset {
            offset += tokio::io::copy(&mut file, out).await?;
            out.flush().await?;
        }
    }
}

/// Delete every `*.log` file in `dir`, returning how many were removed.
pub fn remove_all(dir: &Path) -> io::Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };

    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("log") {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}
