use anyhow::anyhow;
use sentry_core::TransactionContext;
use sentry_core::protocol::SpanStatus;
use std::any::Any;
use std::future::Future;

/// Renders the payload captured by `catch_unwind` into an error.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&str>() {
        anyhow!("job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {message}")
    } else {
        anyhow!("job panicked")
    }
}

/// Wraps a job execution in a sentry transaction, with the status taken
/// from the outcome.
pub(crate) async fn with_sentry_transaction<F, Fut, T>(
    transaction_name: &str,
    callback: F,
) -> anyhow::Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let tx_ctx = TransactionContext::new(transaction_name, "queue.task");
    let transaction = sentry_core::start_transaction(tx_ctx);

    let result = callback().await;

    transaction.set_status(match &result {
        Ok(_) => SpanStatus::Ok,
        Err(_) => SpanStatus::UnknownError,
    });
    transaction.finish();

    result
}
