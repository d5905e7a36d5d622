//! Transaction retry loop.
//!
//! Commit conflicts are the one error class the fabric recovers from in
//! place: the body is re-run against a fresh transaction with exponential
//! backoff until the attempt budget is spent, after which the conflict is
//! surfaced to the caller.

use std::time::Duration;

use futures::future::BoxFuture;

use crate::database::{Database, KvError, Transaction, Versionstamp};

/// Errors that may be transparently retried by [run_transaction].
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for KvError {
    fn is_retryable(&self) -> bool {
        matches!(self, KvError::Conflict)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(3),
        }
    }
}

/// Runs `body` inside a transaction, retrying conflicts per the default
/// [RetryPolicy]. Returns the body's value and the commit stamp.
pub async fn run_transaction<D, T, E, F>(db: &D, body: F) -> Result<(T, Versionstamp), E>
where
    D: Database,
    E: From<KvError> + Retryable,
    F: for<'tx> FnMut(&'tx mut D::Tx) -> BoxFuture<'tx, Result<T, E>>,
{
    run_transaction_with(db, RetryPolicy::default(), body).await
}

pub async fn run_transaction_with<D, T, E, F>(
    db: &D,
    policy: RetryPolicy,
    mut body: F,
) -> Result<(T, Versionstamp), E>
where
    D: Database,
    E: From<KvError> + Retryable,
    F: for<'tx> FnMut(&'tx mut D::Tx) -> BoxFuture<'tx, Result<T, E>>,
{
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;
    loop {
        let mut tx = db.begin().await.map_err(E::from)?;
        let error = match body(&mut tx).await {
            Ok(value) => match tx.commit().await {
                Ok(stamp) => return Ok((value, stamp)),
                Err(commit_error) => E::from(commit_error),
            },
            Err(body_error) => body_error,
        };
        if !error.is_retryable() || attempt >= policy.max_attempts {
            return Err(error);
        }
        tracing::debug!(attempt, backoff_ms = backoff.as_millis() as u64, "retrying transaction after conflict");
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(policy.max_backoff);
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDatabase;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn commits_on_first_attempt() {
        let db = MemoryDatabase::new();
        let (value, _) = run_transaction::<_, _, KvError, _>(&db, |tx| {
            async move {
                tx.set(b"k", b"v");
                Ok(42u32)
            }
            .boxed()
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn retries_conflicts_until_success() {
        let db = MemoryDatabase::new();
        {
            let mut tx = db.begin().await.unwrap();
            tx.set(b"contested", b"0");
            tx.commit().await.unwrap();
        }

        let attempts = AtomicU32::new(0);
        let contender = db.clone();
        let (_, _) = run_transaction_with::<_, _, KvError, _>(
            &db,
            RetryPolicy {
                initial_backoff: Duration::from_millis(1),
                ..RetryPolicy::default()
            },
            |tx| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                let contender = contender.clone();
                async move {
                    tx.get(b"contested").await?;
                    if n == 0 {
                        // Interleave a competing write so the first commit conflicts.
                        let mut other = contender.begin().await?;
                        other.set(b"contested", b"1");
                        other.commit().await?;
                    }
                    tx.set(b"winner", b"me");
                    Ok(())
                }
                .boxed()
            },
        )
        .await
        .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_errors_surface_immediately() {
        let db = MemoryDatabase::new();
        let attempts = AtomicU32::new(0);
        let result = run_transaction::<_, (), KvError, _>(&db, |_tx| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err(KvError::Closed) }.boxed()
        })
        .await;
        assert!(matches!(result, Err(KvError::Closed)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
