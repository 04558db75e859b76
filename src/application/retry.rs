use crate::config::Settings;
use crate::domain::gateway::{GatewayError, GatewayResult};
use crate::domain::ports::{Collection, Document};
use crate::error::{PaymentError, Result};
use std::future::Future;
use tracing::{debug, warn};

/// Read-modify-write of one document under compare-and-set.
///
/// Reloads the document, runs `apply` on the fresh copy and writes it back.
/// A lost race is retried up to `max_retries` times; `apply` sees the latest
/// state on every attempt, so its checks are re-evaluated. An error returned
/// by `apply` aborts without writing.
pub(crate) async fn update_with_retry<T, R, F>(
    collection: &dyn Collection<T>,
    id: &str,
    max_retries: u32,
    not_found: fn(String) -> PaymentError,
    mut apply: F,
) -> Result<(T, R)>
where
    T: Document,
    R: Send,
    F: FnMut(&mut T) -> Result<R> + Send,
{
    let mut attempt = 0;
    loop {
        let mut doc = collection
            .get(id)
            .await?
            .ok_or_else(|| not_found(id.to_string()))?;
        let out = apply(&mut doc)?;
        match collection.update(doc).await {
            Ok(saved) => return Ok((saved, out)),
            Err(PaymentError::ConcurrencyConflict { .. }) if attempt < max_retries => {
                attempt += 1;
                debug!(collection = T::COLLECTION, id, attempt, "write conflict, reloading");
                tokio::task::yield_now().await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Runs a gateway call, retrying transport failures with exponential
/// backoff. Gateway answers (including declines) are returned as they come.
///
/// Returns [`PaymentError::GatewayTransport`] once retries are exhausted.
pub(crate) async fn dispatch_with_retry<F, Fut>(
    settings: &Settings,
    reference: &str,
    mut call: F,
) -> Result<GatewayResult>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<GatewayResult, GatewayError>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(result) => return Ok(result),
            Err(error) if attempt <= settings.max_gateway_retries => {
                let backoff = settings.retry_backoff(attempt);
                warn!(
                    reference,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    %error,
                    "gateway transport error, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(source) => {
                return Err(PaymentError::GatewayTransport {
                    reference: reference.to_string(),
                    attempts: attempt,
                    source,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::{AccountType, LedgerAccount};
    use crate::domain::money::Balance;
    use crate::domain::payment::FeeBreakdown;
    use crate::infrastructure::in_memory::InMemoryCollection;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_settings(max_gateway_retries: u32) -> Settings {
        Settings {
            max_gateway_retries,
            retry_backoff_ms: 1,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn test_update_with_retry_applies_to_fresh_copy() {
        let store = InMemoryCollection::new();
        store
            .insert(LedgerAccount::new("1000", "Cash", AccountType::Asset))
            .await
            .unwrap();

        let (saved, previous) = update_with_retry(
            &store,
            "1000",
            3,
            PaymentError::AccountNotFound,
            |account: &mut LedgerAccount| {
                let previous = account.current_balance;
                account.post(dec!(25), dec!(0));
                Ok(previous)
            },
        )
        .await
        .unwrap();
        assert_eq!(previous, Balance::ZERO);
        assert_eq!(saved.current_balance, Balance::new(dec!(25)));
        assert_eq!(saved.version, 1);
    }

    #[tokio::test]
    async fn test_update_with_retry_reports_missing_document() {
        let store: InMemoryCollection<LedgerAccount> = InMemoryCollection::new();
        let result = update_with_retry(&store, "9999", 3, PaymentError::AccountNotFound, |_| Ok(()))
            .await;
        assert!(matches!(result, Err(PaymentError::AccountNotFound(id)) if id == "9999"));
    }

    #[tokio::test]
    async fn test_concurrent_postings_are_never_lost() {
        let store = Arc::new(InMemoryCollection::new());
        store
            .insert(LedgerAccount::new("1000", "Cash", AccountType::Asset))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                update_with_retry(
                    store.as_ref(),
                    "1000",
                    50,
                    PaymentError::AccountNotFound,
                    |account: &mut LedgerAccount| {
                        account.post(dec!(1), dec!(0));
                        Ok(())
                    },
                )
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let account = store.get("1000").await.unwrap().unwrap();
        assert_eq!(account.current_balance, Balance::new(dec!(10)));
    }

    #[tokio::test]
    async fn test_dispatch_retries_transport_errors() {
        let calls = AtomicU32::new(0);
        let result = dispatch_with_retry(&fast_settings(2), "pay-1", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(GatewayError::Timeout)
                } else {
                    Ok(GatewayResult::completed(
                        "ext-1",
                        FeeBreakdown::default(),
                        serde_json::Value::Null,
                    ))
                }
            }
        })
        .await
        .unwrap();
        assert!(result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_dispatch_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result = dispatch_with_retry(&fast_settings(1), "pay-1", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GatewayError::Network("connection reset".to_string())) }
        })
        .await;
        assert!(matches!(
            result,
            Err(PaymentError::GatewayTransport { attempts: 2, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
