//! Same-tick read coalescing.
//!
//! Reads enqueued within a short window are flushed together as one
//! `POST /batch` round trip through the dispatcher (so the batch call
//! itself gets auth, retry, and refresh handling). Each waiter resolves
//! from its positional slice of the results array, in enqueue order; a
//! failed batch call rejects every waiter with the same error.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use super::client::{Dispatcher, RequestOptions};
use super::transport::Method;
use super::ApiError;

/// Endpoint accepting coalesced reads.
const BATCH_ENDPOINT: &str = "/batch";

struct BatchItem {
    endpoint: String,
    params: Option<Value>,
    resolve: oneshot::Sender<Result<Value, ApiError>>,
}

#[derive(Default)]
struct BatchQueue {
    items: Vec<BatchItem>,
    flushing: bool,
}

pub struct BatchCoalescer {
    dispatcher: Arc<Dispatcher>,
    window: Duration,
    queue: Mutex<BatchQueue>,
}

impl BatchCoalescer {
    pub fn new(dispatcher: Arc<Dispatcher>, window: Duration) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            window,
            queue: Mutex::new(BatchQueue::default()),
        })
    }

    /// Enqueue one read; resolves when its batch comes back.
    pub async fn enqueue(
        self: &Arc<Self>,
        endpoint: &str,
        params: Option<Value>,
    ) -> Result<Value, ApiError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self.queue.lock().await;
            queue.items.push(BatchItem {
                endpoint: endpoint.to_string(),
                params,
                resolve: tx,
            });
            if !queue.flushing {
                queue.flushing = true;
                let coalescer = Arc::clone(self);
                tokio::spawn(async move { coalescer.flush_after_window().await });
            }
        }
        rx.await
            .map_err(|_| ApiError::NetworkTransient("batch flush dropped".into()))?
    }

    async fn flush_after_window(self: Arc<Self>) {
        tokio::time::sleep(self.window).await;
        let items: Vec<BatchItem> = {
            let mut queue = self.queue.lock().await;
            // Close this window before the network call so late arrivals
            // open a fresh one instead of waiting on ours.
            queue.flushing = false;
            std::mem::take(&mut queue.items)
        };
        if items.is_empty() {
            return;
        }
        debug!(count = items.len(), "flushing coalesced reads");

        let requests: Vec<Value> = items
            .iter()
            .map(|item| json!({ "endpoint": item.endpoint, "params": item.params }))
            .collect();
        let outcome = self
            .dispatcher
            .request(
                Method::Post,
                BATCH_ENDPOINT,
                Some(json!({ "requests": requests })),
                RequestOptions::default(),
            )
            .await;

        match outcome {
            Ok(value) => {
                let results = value
                    .get("results")
                    .and_then(Value::as_array)
                    .filter(|results| results.len() == items.len())
                    .cloned();
                match results {
                    Some(results) => {
                        for (item, result) in items.into_iter().zip(results) {
                            let _ = item.resolve.send(Ok(result));
                        }
                    }
                    None => {
                        let err = ApiError::InvalidResponse(
                            "batch response does not match request count".into(),
                        );
                        for item in items {
                            let _ = item.resolve.send(Err(err.clone()));
                        }
                    }
                }
            }
            Err(err) => {
                // No partial-success assumption: one failure fails all.
                for item in items {
                    let _ = item.resolve.send(Err(err.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::transport::testing::MockTransport;
    use crate::auth::{Credential, TokenManager};
    use crate::cache::ResponseCache;
    use crate::config::ClientConfig;
    use crate::events::EventBus;
    use crate::store::MemoryStore;
    use futures::future::join_all;

    async fn coalescer_with(transport: Arc<MockTransport>) -> Arc<BatchCoalescer> {
        let config = ClientConfig {
            api_base_url: "https://api.test".into(),
            ..ClientConfig::default()
        };
        let tokens = TokenManager::new(
            transport.clone(),
            Arc::new(MemoryStore::new()),
            EventBus::new(),
            &config,
        );
        tokens
            .install(
                "u-1",
                Credential::from_expires_in("A1".into(), "R1".into(), None),
            )
            .await
            .unwrap();
        let cache = Arc::new(Mutex::new(ResponseCache::new(
            config.cache_ttl_minutes,
            config.cache_capacity,
        )));
        let dispatcher = Dispatcher::new(transport, tokens, cache, &config);
        BatchCoalescer::new(dispatcher, Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_same_window_reads_share_one_round_trip() {
        let transport = MockTransport::new(|request| {
            let body = request.body.as_ref().expect("batch body");
            let count = body["requests"].as_array().unwrap().len();
            let results: Vec<Value> = (0..count).map(|i| json!({ "slot": i })).collect();
            Ok(MockTransport::ok(json!({ "results": results })))
        });
        let coalescer = coalescer_with(transport.clone()).await;

        let futures = ["/users/1", "/users/2", "/users/3"].map(|endpoint| {
            let coalescer = coalescer.clone();
            async move { coalescer.enqueue(endpoint, None).await }
        });
        let results = join_all(futures).await;

        assert_eq!(transport.count_to("/batch"), 1);
        // Waiters resolve from their own slice, in enqueue order.
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), json!({ "slot": i }));
        }

        let call = &transport.calls()[0];
        let sent = call.body.as_ref().unwrap()["requests"].as_array().unwrap().clone();
        assert_eq!(sent[0]["endpoint"], "/users/1");
        assert_eq!(sent[2]["endpoint"], "/users/3");
    }

    #[tokio::test]
    async fn test_enqueues_after_the_window_open_a_new_batch() {
        let transport = MockTransport::new(|request| {
            let count = request.body.as_ref().unwrap()["requests"]
                .as_array()
                .unwrap()
                .len();
            let results: Vec<Value> = (0..count).map(|_| json!("ok")).collect();
            Ok(MockTransport::ok(json!({ "results": results })))
        });
        let coalescer = coalescer_with(transport.clone()).await;

        coalescer.enqueue("/users/1", None).await.unwrap();
        coalescer.enqueue("/users/2", None).await.unwrap();

        assert_eq!(transport.count_to("/batch"), 2);
    }

    #[tokio::test]
    async fn test_batch_failure_rejects_every_waiter_with_the_same_error() {
        let transport = MockTransport::new(|_| Ok(MockTransport::status(400, "bad batch")));
        let coalescer = coalescer_with(transport.clone()).await;

        let futures = ["/users/1", "/users/2"].map(|endpoint| {
            let coalescer = coalescer.clone();
            async move { coalescer.enqueue(endpoint, None).await }
        });
        let results = join_all(futures).await;

        for result in results {
            assert!(matches!(result, Err(ApiError::Validation { .. })));
        }
        assert_eq!(transport.count_to("/batch"), 1);
    }

    #[tokio::test]
    async fn test_arity_mismatch_is_an_invalid_response() {
        let transport =
            MockTransport::new(|_| Ok(MockTransport::ok(json!({ "results": ["only one"] }))));
        let coalescer = coalescer_with(transport).await;

        let futures = ["/users/1", "/users/2"].map(|endpoint| {
            let coalescer = coalescer.clone();
            async move { coalescer.enqueue(endpoint, None).await }
        });
        for result in join_all(futures).await {
            assert!(matches!(result, Err(ApiError::InvalidResponse(_))));
        }
    }
}
