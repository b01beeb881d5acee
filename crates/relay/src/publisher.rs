//! Publishing a row stream onto a durable queue.

use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use rowbus_core::{RelayError, Row};
use rowbus_queue::{Broker, QueuePublisher};
use rowbus_store::StoreError;

/// Publish every row of `rows` to `queue`, one persistent message per row, in
/// stream order.
///
/// Opens one connection and channel, declares the queue durable, and always
/// closes the connection before returning. A failure stops the run; rows
/// already published stay on the queue and the error carries their count.
pub async fn publish_all<S>(broker: &dyn Broker, queue: &str, rows: S) -> Result<u64, RelayError>
where
    S: Stream<Item = Result<Row, StoreError>> + Send,
{
    let mut publisher = broker.publisher().await.map_err(|e| RelayError::Publish {
        published: 0,
        reason: e.to_string(),
    })?;

    let result = publish_rows(publisher.as_mut(), queue, rows).await;

    if let Err(e) = publisher.close().await {
        warn!(queue, error = %e, "closing publisher connection failed");
    }
    result
}

async fn publish_rows<S>(
    publisher: &mut dyn QueuePublisher,
    queue: &str,
    rows: S,
) -> Result<u64, RelayError>
where
    S: Stream<Item = Result<Row, StoreError>> + Send,
{
    let mut published = 0u64;
    let fail = |published: u64, reason: String| RelayError::Publish { published, reason };

    publisher
        .declare_queue(queue)
        .await
        .map_err(|e| fail(published, e.to_string()))?;

    futures::pin_mut!(rows);
    while let Some(row) = rows.next().await {
        let row = row.map_err(|e| fail(published, e.to_string()))?;
        let payload = row
            .encode()
            .and_then(|message| message.to_bytes())
            .map_err(|e| fail(published, e.to_string()))?;
        publisher
            .publish(queue, &payload)
            .await
            .map_err(|e| fail(published, e.to_string()))?;
        published += 1;
        debug!(queue, published, "row published");
    }

    info!(queue, published, "all rows published");
    Ok(published)
}
