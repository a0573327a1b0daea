//! Transient-error classification and the retry runner
//!
//! Network faults between the daemon, the IMAP server and the analyzer
//! usually come in bursts of the same error (connection reset during a
//! server restart, refused connections while it is down, ...). The
//! [`Runner`] therefore counts *consecutive identical* failures and
//! resets the counter whenever the root cause changes: progress through
//! different errors never trips the cap, a wall of identical errors
//! does.

use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};

/// Classifies an error as transient (worth retrying) or fatal.
///
/// Walks the whole `source()` chain, not just the outermost value:
/// the interesting io error is usually wrapped in one or more layers
/// of context.
pub fn is_transient(err: &Error) -> bool {
    if let Error::Aggregate(errs) = err {
        return errs.iter().any(is_transient);
    }

    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if let Some(err) = e.downcast_ref::<Error>() {
            if matches!(err, Error::Retryable(_)) {
                return true;
            }
        }

        if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
            if is_transient_io(io_err) {
                return true;
            }
        }

        if let Some(imap_err) = e.downcast_ref::<async_imap::error::Error>() {
            if matches!(imap_err, async_imap::error::Error::ConnectionLost) {
                return true;
            }
        }

        if let Some(req_err) = e.downcast_ref::<reqwest::Error>() {
            if req_err.is_connect() || req_err.is_timeout() {
                return true;
            }
        }

        if e.to_string().contains("use of closed network connection") {
            return true;
        }

        cur = e.source();
    }

    false
}

fn is_transient_io(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    matches!(
        err.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::NetworkUnreachable
            | ErrorKind::HostUnreachable
            | ErrorKind::UnexpectedEof
    )
}

/// Marks an error as retryable when the classifier considers it
/// transient, otherwise returns it unchanged.
pub fn into_retryable(err: Error) -> Error {
    if matches!(err, Error::Retryable(_)) {
        return err;
    }

    if is_transient(&err) {
        return Error::Retryable(Box::new(err));
    }

    err
}

/// Executes an operation until it succeeds, a fatal error occurs, or
/// too many consecutive identical transient errors were observed.
///
/// `retry_intervals` must be non-empty; the last interval is reused for
/// all further retries, producing a flat tail instead of exponential
/// growth.
pub struct Runner<C> {
    pub is_retryable: C,
    pub max_retries_same_error: u32,
    pub retry_intervals: Vec<Duration>,
}

impl<C> Runner<C>
where
    C: Fn(&Error) -> bool,
{
    pub async fn run<T, F, Fut>(&self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut failures: u32 = 0;
        let mut last_root: Option<String> = None;

        loop {
            let err = match f().await {
                Ok(v) => return Ok(v),
                Err(err) => err,
            };

            failures += 1;

            if !(self.is_retryable)(&err) {
                return Err(err);
            }

            let root = root_cause(&err);
            if last_root.as_deref() == Some(root.as_str()) {
                if failures >= self.max_retries_same_error {
                    return Err(Error::MaxRetriesExceeded {
                        retries: failures,
                        source: Box::new(err),
                    });
                }
            } else {
                failures = 1;
            }
            last_root = Some(root);

            let pause = self.sleep_time(failures);
            warn!(
                error = %err,
                failures,
                max_retries = self.max_retries_same_error,
                pause_secs = pause.as_secs_f64(),
                "retryable error occurred, retrying after pause"
            );
            tokio::time::sleep(pause).await;
        }
    }

    fn sleep_time(&self, failures: u32) -> Duration {
        let idx = (failures as usize - 1).min(self.retry_intervals.len() - 1);
        self.retry_intervals[idx]
    }
}

/// The leaf of the error's source chain, rendered as a string.
///
/// Two errors are "the same" for retry counting when their root causes
/// render identically.
fn root_cause(err: &Error) -> String {
    let mut cur: &(dyn std::error::Error + 'static) = err;
    while let Some(next) = cur.source() {
        cur = next;
    }
    cur.to_string()
}
