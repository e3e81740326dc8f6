//! Incremental relay of a streamed vendor response.
//!
//! A spawned pump pulls the upstream body into a bounded channel and the
//! caller drains the other end. The pump only asks upstream for the next
//! chunk once the previous one has a slot in the channel, so a fast vendor
//! cannot outrun a slow caller by more than `capacity` chunks. When the
//! caller drops its end the pump notices (even while parked on upstream) and
//! drops the upstream response, which closes the connection.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::dispatcher::ChunkStream;
use crate::error::{GatewayError, Result};

pub const DEFAULT_RELAY_CAPACITY: usize = 16;

pub struct StreamRelay;

impl StreamRelay {
    /// Relay an open reqwest response body.
    pub fn spawn(
        response: reqwest::Response,
        vendor: &str,
        idle_timeout: Duration,
        capacity: usize,
    ) -> ChunkStream {
        let upstream = response.bytes_stream().map(|item| item.map_err(|e| e.to_string()));
        Self::spawn_stream(upstream, vendor, idle_timeout, capacity)
    }

    /// Relay any byte stream; upstream errors are carried as plain reasons.
    pub fn spawn_stream<S>(
        upstream: S,
        vendor: &str,
        idle_timeout: Duration,
        capacity: usize,
    ) -> ChunkStream
    where
        S: Stream<Item = std::result::Result<Bytes, String>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Result<Bytes>>(capacity.max(1));
        tokio::spawn(pump(Box::pin(upstream), tx, vendor.to_string(), idle_timeout));

        Box::pin(async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        })
    }
}

async fn pump<S>(
    mut upstream: std::pin::Pin<Box<S>>,
    tx: mpsc::Sender<Result<Bytes>>,
    vendor: String,
    idle_timeout: Duration,
) where
    S: Stream<Item = std::result::Result<Bytes, String>> + Send + ?Sized,
{
    let mut relayed: u64 = 0;
    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                debug!(vendor = %vendor, chunks = relayed, "Caller went away; closing upstream stream");
                return;
            }
            next = tokio::time::timeout(idle_timeout, upstream.next()) => next,
        };

        let item = match next {
            Ok(Some(Ok(chunk))) if chunk.is_empty() => continue,
            Ok(Some(Ok(chunk))) => Ok(chunk),
            Ok(Some(Err(reason))) => Err(GatewayError::StreamInterrupted {
                vendor: vendor.clone(),
                reason,
            }),
            Ok(None) => {
                debug!(vendor = %vendor, chunks = relayed, "Upstream stream finished");
                return;
            }
            Err(_) => Err(GatewayError::StreamInterrupted {
                vendor: vendor.clone(),
                reason: format!("no data for {}s", idle_timeout.as_secs_f32()),
            }),
        };

        let terminal = item.is_err();
        if terminal {
            warn!(vendor = %vendor, chunks = relayed, "Upstream stream interrupted");
        }
        // Waits for a free slot: this is where back-pressure applies.
        if tx.send(item).await.is_err() {
            debug!(vendor = %vendor, chunks = relayed, "Caller went away; closing upstream stream");
            return;
        }
        if terminal {
            return;
        }
        relayed += 1;
    }
}
