use crate::broker::{BatchRecord, BatchStream};
use crate::constants::{CONSUMER_READ_COUNT, CONSUMER_RECONNECT_PAUSE_MS, CONSUMER_RETRY_PAUSE_MS};
use crate::envelope::BatchMessage;
use crate::error::Result;
use crate::reconciler::{BatchStats, Reconciler};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// The worker service loop: claim records under the consumer group, apply
/// each through the reconciler, ack+delete on success.
///
/// A record that fails to process stays unacked so group redelivery retries
/// it; a broker-level failure pauses longer and the loop continues. The loop
/// never terminates on its own; exit is external process termination.
pub async fn run_consumer(
    stream: Arc<dyn BatchStream>,
    reconciler: Arc<Reconciler>,
    consumer_name: &str,
) -> Result<()> {
    stream.ensure_group().await?;
    info!(consumer = %consumer_name, "Consumer loop started");

    loop {
        match stream.claim(consumer_name, CONSUMER_READ_COUNT).await {
            Ok(records) => {
                for record in records {
                    match process_record(&record, &reconciler).await {
                        Ok(stats) => {
                            match stream.ack(&record.id).await {
                                Ok(()) => crate::metrics::broker::acked(),
                                Err(e) => {
                                    // The record will be redelivered; the
                                    // reconciler absorbs the duplicate.
                                    error!(record_id = %record.id, "Ack failed: {}", e);
                                }
                            }
                            if !stats.errors.is_empty() {
                                info!(
                                    record_id = %record.id,
                                    item_errors = stats.errors.len(),
                                    "Record acked with item errors"
                                );
                            }
                        }
                        Err(e) => {
                            error!(
                                record_id = %record.id,
                                "Processing failed; leaving record for redelivery: {}", e
                            );
                            crate::metrics::broker::redelivery_pending();
                            tokio::time::sleep(Duration::from_millis(CONSUMER_RETRY_PAUSE_MS))
                                .await;
                        }
                    }
                }
            }
            Err(e) => {
                error!("Consumer read failed; retrying: {}", e);
                tokio::time::sleep(Duration::from_millis(CONSUMER_RECONNECT_PAUSE_MS)).await;
            }
        }
    }
}

/// Decode and apply one claimed record. Only a record whose fields cannot be
/// decoded fails here; item-level failures are inside `BatchStats`.
async fn process_record(record: &BatchRecord, reconciler: &Reconciler) -> Result<BatchStats> {
    let batch = BatchMessage::from_fields(&record.fields)?;
    Ok(reconciler.apply(&batch).await)
}
