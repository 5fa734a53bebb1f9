//! Background writer for cache population.
//!
//! Strategies hand responses to the writer and return to their caller
//! straight away. A single consumer task drains the queue and persists each
//! job; failures are logged and otherwise dropped.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::net::Response;

use super::storage::CacheStorage;
use super::traits::RequestKey;

enum WriteJob {
  Put {
    store: String,
    key: RequestKey,
    response: Response,
  },
  /// Acknowledged once every job queued before it has been applied
  Flush(oneshot::Sender<()>),
}

/// Handle to the write queue. Cheap to clone.
#[derive(Clone)]
pub struct CacheWriter {
  tx: mpsc::UnboundedSender<WriteJob>,
}

impl CacheWriter {
  /// Spawn the consumer task on the current tokio runtime.
  pub fn spawn(storage: Arc<dyn CacheStorage>) -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      while let Some(job) = rx.recv().await {
        match job {
          WriteJob::Put {
            store,
            key,
            response,
          } => {
            let storage = Arc::clone(&storage);
            // rusqlite is blocking; keep it off the async workers
            let outcome = tokio::task::spawn_blocking(move || {
              storage
                .put(&store, &key, &response)
                .map_err(|e| CacheError::StoreWriteFailure {
                  store: store.clone(),
                  key: key.to_string(),
                  reason: e.to_string(),
                })
                .map(|_| (store, key))
            })
            .await;

            match outcome {
              Ok(Ok((store, key))) => debug!(store = %store, key = %key, "stored"),
              Ok(Err(e)) => warn!(error = %e, "cache write dropped"),
              Err(e) => warn!(error = %e, "cache write task failed"),
            }
          }
          WriteJob::Flush(ack) => {
            let _ = ack.send(());
          }
        }
      }
    });

    Self { tx }
  }

  /// Queue a response for storage. Never blocks and never fails the caller.
  pub fn enqueue(&self, store: &str, key: RequestKey, response: Response) {
    let job = WriteJob::Put {
      store: store.to_string(),
      key,
      response,
    };
    if self.tx.send(job).is_err() {
      warn!(store, "cache writer is gone, dropping write");
    }
  }

  /// Wait until everything queued so far has been written (or dropped).
  pub async fn flush(&self) {
    let (ack, done) = oneshot::channel();
    if self.tx.send(WriteJob::Flush(ack)).is_ok() {
      let _ = done.await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::MemoryStorage;
  use crate::cache::traits::StoredResponse;
  use color_eyre::{eyre::eyre, Result};
  use url::Url;

  /// Storage whose writes always fail.
  struct BrokenStorage;

  impl CacheStorage for BrokenStorage {
    fn open_store(&self, _name: &str) -> Result<()> {
      Err(eyre!("disk full"))
    }
    fn has_store(&self, _name: &str) -> Result<bool> {
      Ok(false)
    }
    fn store_names(&self) -> Result<Vec<String>> {
      Ok(Vec::new())
    }
    fn seal_store(&self, _name: &str) -> Result<()> {
      Err(eyre!("disk full"))
    }
    fn is_sealed(&self, _name: &str) -> Result<bool> {
      Ok(false)
    }
    fn delete_store(&self, _name: &str) -> Result<bool> {
      Ok(false)
    }
    fn put(&self, _store: &str, _key: &RequestKey, _response: &Response) -> Result<()> {
      Err(eyre!("disk full"))
    }
    fn lookup(&self, _store: &str, _key: &RequestKey) -> Result<Option<StoredResponse>> {
      Ok(None)
    }
    fn keys(&self, _store: &str) -> Result<Vec<RequestKey>> {
      Ok(Vec::new())
    }
  }

  fn key(url: &str) -> RequestKey {
    RequestKey::new("GET", &Url::parse(url).unwrap())
  }

  #[tokio::test]
  async fn test_flush_waits_for_queued_writes() {
    let storage = Arc::new(MemoryStorage::new());
    let writer = CacheWriter::spawn(storage.clone());

    for i in 0..10 {
      writer.enqueue(
        "s",
        key(&format!("https://a.example/{}", i)),
        Response::new(200, "x"),
      );
    }
    writer.flush().await;

    assert_eq!(storage.keys("s").unwrap().len(), 10);
  }

  #[tokio::test]
  async fn test_write_failure_is_swallowed() {
    let writer = CacheWriter::spawn(Arc::new(BrokenStorage));
    writer.enqueue("s", key("https://a.example/"), Response::new(200, "x"));
    writer.flush().await;
    // Still accepting work after a failure
    writer.enqueue("s", key("https://a.example/b"), Response::new(200, "y"));
    writer.flush().await;
  }
}
