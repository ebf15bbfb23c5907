//! Async reads and writes on a tokio runtime.
//!
//! Each operation runs as two blocking jobs. The first takes the range lock
//! and does the I/O (for writes, the tag update comes first). The second
//! finishes the checksum work or the data write and drops the lock. Writes
//! drive both jobs from a detached task, so once started they run to the end
//! even if the future awaiting them is dropped. Closing a file waits until
//! every operation started on it has finished.

use crate::error::{CsiError, CsiResult};
use crate::file::{CsiFile, FileInner};
use crate::pages::{tags_spanned, PgOptions};
use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::sync::Arc;
use tokio::task::{self, JoinError};

/// Counts a file's in-flight async operations.
#[derive(Debug, Default)]
pub(crate) struct AioTracker {
    pending: Mutex<usize>,
    idle: Condvar,
}

impl AioTracker {
    /// Blocks until no operation is in flight.
    pub(crate) fn wait_idle(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.idle.wait(&mut pending);
        }
    }

    fn pending(&self) -> usize {
        *self.pending.lock()
    }
}

/// Keeps a file's operation counted until dropped.
struct AioTicket {
    file: Arc<FileInner>,
}

impl AioTicket {
    fn new(file: &Arc<FileInner>) -> Self {
        *file.aio.pending.lock() += 1;
        Self {
            file: Arc::clone(file),
        }
    }
}

impl Drop for AioTicket {
    fn drop(&mut self) {
        let mut pending = self.file.aio.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.file.aio.idle.notify_all();
        }
    }
}

fn joined<T>(res: Result<CsiResult<T>, JoinError>) -> CsiResult<T> {
    res.map_err(|err| CsiError::aio(err.to_string()))?
}

/// Runs `work` as its own task and waits for it. Dropping the returned
/// future detaches the task rather than cancelling it.
async fn detached<T, F>(work: F) -> CsiResult<T>
where
    F: Future<Output = CsiResult<T>> + Send + 'static,
    T: Send + 'static,
{
    joined(task::spawn(work).await)
}

impl CsiFile {
    fn ticket(&self) -> CsiResult<AioTicket> {
        Ok(AioTicket::new(self.inner()?))
    }

    /// Number of async operations in flight on this handle.
    #[must_use]
    pub fn aio_pending(&self) -> usize {
        self.inner().map_or(0, |inner| inner.aio.pending())
    }

    /// Reads up to `len` bytes at `offset` and verifies them.
    ///
    /// # Errors
    ///
    /// As [`CsiFile::read`], plus `Aio` if a job panicked or the runtime
    /// shut down.
    pub async fn read_async(&self, offset: u64, len: usize) -> CsiResult<Vec<u8>> {
        let ticket = self.ticket()?;

        let (ticket, guard, buf) = joined(
            task::spawn_blocking(move || {
                let mut buf = vec![0u8; len];
                let (guard, n) = ticket.file.begin_read(&mut buf, offset)?;
                buf.truncate(n);
                Ok((ticket, guard, buf))
            })
            .await,
        )?;

        joined(
            task::spawn_blocking(move || {
                ticket.file.finish_read(guard, &buf, offset, len)?;
                Ok(buf)
            })
            .await,
        )
    }

    /// Reads up to `len` bytes at `offset` and returns them with their page
    /// checksums.
    ///
    /// # Errors
    ///
    /// As [`CsiFile::pg_read`], plus `Aio`.
    pub async fn pg_read_async(
        &self,
        offset: u64,
        len: usize,
        opts: PgOptions,
    ) -> CsiResult<(Vec<u8>, Vec<u32>)> {
        let ticket = self.ticket()?;

        let (ticket, guard, buf) = joined(
            task::spawn_blocking(move || {
                let mut buf = vec![0u8; len];
                let (guard, n) = ticket.file.begin_read(&mut buf, offset)?;
                buf.truncate(n);
                Ok((ticket, guard, buf))
            })
            .await,
        )?;

        joined(
            task::spawn_blocking(move || {
                let mut csvec = vec![0u32; tags_spanned(offset, buf.len())];
                ticket
                    .file
                    .finish_pg_read(guard, &buf, offset, len, Some(&mut csvec), opts)?;
                Ok((buf, csvec))
            })
            .await,
        )
    }

    /// Writes `buf` at `offset`. Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// As [`CsiFile::write`], plus `Aio`.
    pub async fn write_async(&self, buf: Vec<u8>, offset: u64) -> CsiResult<usize> {
        let ticket = self.ticket()?;

        detached(async move {
            let (ticket, guard, buf) = joined(
                task::spawn_blocking(move || {
                    let guard = ticket.file.begin_write(&buf, offset)?;
                    Ok((ticket, guard, buf))
                })
                .await,
            )?;

            joined(
                task::spawn_blocking(move || ticket.file.finish_write(guard, &buf, offset)).await,
            )
        })
        .await
    }

    /// Writes `buf` at `offset` with page checksums `csvec`, or with
    /// computed ones under [`PgOptions::DO_CALC`].
    ///
    /// # Errors
    ///
    /// As [`CsiFile::pg_write`], plus `Aio`.
    pub async fn pg_write_async(
        &self,
        buf: Vec<u8>,
        offset: u64,
        mut csvec: Option<Vec<u32>>,
        opts: PgOptions,
    ) -> CsiResult<usize> {
        let ticket = self.ticket()?;

        detached(async move {
            let (ticket, guard, buf) = joined(
                task::spawn_blocking(move || {
                    let guard =
                        ticket
                            .file
                            .begin_pg_write(&buf, offset, csvec.as_deref_mut(), opts)?;
                    Ok((ticket, guard, buf))
                })
                .await,
            )?;

            joined(
                task::spawn_blocking(move || ticket.file.finish_write(guard, &buf, offset)).await,
            )
        })
        .await
    }
}
