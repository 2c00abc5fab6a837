//! Bounded exponential backoff for transient SQLite contention.
//!
//! The store is accessed from a single controller thread (spec §5), so
//! retries block that thread with `std::thread::sleep` rather than an async
//! timer — there is nothing else for the thread to do while the lock clears.

use std::thread;
use std::time::Duration;

use rand::Rng;
use rusqlite::ErrorCode;
use tracing::warn;

use crate::error::StoreError;

const MAX_ATTEMPTS: u32 = 5;
const BASE_DELAY_MS: u64 = 20;
const MAX_DELAY_MS: u64 = 500;

fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Run `f` against the connection, retrying transient `SQLITE_BUSY`/`SQLITE_LOCKED`
/// failures with bounded exponential backoff and jitter. Non-transient errors and
/// exhausted retries surface immediately.
pub(crate) fn with_retry<T>(
    op: &'static str,
    mut f: impl FnMut() -> rusqlite::Result<T>,
) -> Result<T, StoreError> {
    let mut attempt = 0u32;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) && attempt + 1 < MAX_ATTEMPTS => {
                attempt += 1;
                let backoff = (BASE_DELAY_MS * 2u64.pow(attempt)).min(MAX_DELAY_MS);
                let jitter = rand::rng().random_range(0..=backoff / 2);
                let delay = Duration::from_millis(backoff + jitter);
                warn!(op, attempt, ?delay, "store busy, retrying");
                thread::sleep(delay);
            }
            Err(err) if is_transient(&err) => {
                return Err(StoreError::RetryExhausted {
                    op,
                    attempts: attempt + 1,
                });
            }
            Err(err) => return Err(StoreError::from_sqlite(op, err)),
        }
    }
}
