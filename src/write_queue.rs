//! Single-writer queue for persistence work.
//!
//! Producers enqueue futures from any task without waiting. One consumer task
//! awaits them strictly in arrival order, so the backing store never sees two
//! writes at once. A failed write is logged with its context label and dropped.

use std::{fmt, future::Future, panic::AssertUnwindSafe, pin::Pin};

use futures_util::FutureExt;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, warn};

type Operation = Pin<Box<dyn Future<Output = Result<(), WriteTaskError>> + Send>>;

struct WriteTask {
    operation: Operation,
    context: Option<String>,
}

#[derive(Debug, Error)]
pub enum WriteTaskError {
    #[error("{0}")]
    Failed(String),
    #[error("write operation panicked")]
    Panicked,
}

/// Owner of the queue: starts the consumer and controls its shutdown.
#[derive(Debug)]
pub struct WriteQueue {
    handle: WriteQueueHandle,
    worker: JoinHandle<()>,
}

/// Cloneable producer side of a [`WriteQueue`].
#[derive(Clone)]
pub struct WriteQueueHandle {
    sender: mpsc::UnboundedSender<WriteTask>,
}

impl fmt::Debug for WriteQueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteQueueHandle")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl WriteQueue {
    /// Spawns the consumer on the current tokio runtime.
    pub fn start() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(consume(receiver));
        Self {
            handle: WriteQueueHandle { sender },
            worker,
        }
    }

    pub fn handle(&self) -> WriteQueueHandle {
        self.handle.clone()
    }

    pub fn enqueue<F, T, E>(&self, operation: F, context: Option<&str>)
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: 'static,
        E: fmt::Display + 'static,
    {
        self.handle.enqueue(operation, context);
    }

    /// Closes this owner's sender and waits for the consumer to finish.
    ///
    /// The consumer only stops once every [`WriteQueueHandle`] is gone, and it
    /// still runs whatever was queued before that point. Callers that cannot
    /// wait indefinitely wrap this in a timeout.
    pub async fn shutdown(self) {
        let WriteQueue { handle, worker } = self;
        drop(handle);
        if let Err(err) = worker.await {
            error!(error = %err, "write queue consumer terminated abnormally");
        }
    }
}

impl WriteQueueHandle {
    /// Appends `operation` to the queue. Never blocks; the queue is unbounded.
    pub fn enqueue<F, T, E>(&self, operation: F, context: Option<&str>)
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: 'static,
        E: fmt::Display + 'static,
    {
        let operation: Operation = Box::pin(async move {
            operation
                .await
                .map(|_| ())
                .map_err(|err| WriteTaskError::Failed(err.to_string()))
        });
        let task = WriteTask {
            operation,
            context: context.map(str::to_owned),
        };
        if self.sender.send(task).is_err() {
            warn!(context = ?context, "write queue is closed; dropping operation");
        }
    }
}

async fn consume(mut receiver: mpsc::UnboundedReceiver<WriteTask>) {
    while let Some(WriteTask { operation, context }) = receiver.recv().await {
        let outcome = AssertUnwindSafe(operation)
            .catch_unwind()
            .await
            .unwrap_or(Err(WriteTaskError::Panicked));

        match (outcome, context.as_deref()) {
            (Ok(()), Some(context)) => debug!(context, "queued write completed"),
            (Ok(()), None) => {}
            (Err(err), Some(context)) => error!(context, error = %err, "queued write failed"),
            (Err(err), None) => error!(error = %err, "queued write failed"),
        }
    }
    debug!("write queue consumer stopped");
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use super::*;

    #[derive(Clone, Default)]
    struct Journal {
        entries: Arc<Mutex<Vec<&'static str>>>,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Journal {
        fn write(
            &self,
            label: &'static str,
            delay_ms: u64,
            fail: bool,
        ) -> impl Future<Output = Result<(), String>> + Send + 'static {
            let journal = self.clone();
            async move {
                let now = journal.active.fetch_add(1, Ordering::SeqCst) + 1;
                journal.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                journal.active.fetch_sub(1, Ordering::SeqCst);
                if fail {
                    return Err(format!("{label} failed"));
                }
                journal.entries.lock().unwrap().push(label);
                Ok(())
            }
        }

        fn entries(&self) -> Vec<&'static str> {
            self.entries.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn runs_operations_in_enqueue_order() {
        let queue = WriteQueue::start();
        let journal = Journal::default();

        queue.enqueue(journal.write("o1", 60, false), Some("o1"));
        queue.enqueue(journal.write("o2", 5, false), Some("o2"));
        queue.enqueue(journal.write("o3", 0, false), None);

        queue.shutdown().await;
        assert_eq!(journal.entries(), vec!["o1", "o2", "o3"]);
        assert_eq!(journal.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_operation_does_not_stop_the_queue() {
        let queue = WriteQueue::start();
        let journal = Journal::default();

        queue.enqueue(journal.write("o1", 10, false), Some("o1"));
        queue.enqueue(journal.write("o2", 0, true), Some("o2"));
        queue.enqueue(journal.write("o3", 0, false), Some("o3"));

        queue.shutdown().await;
        assert_eq!(journal.entries(), vec!["o1", "o3"]);
    }

    #[tokio::test]
    async fn panicking_operation_is_isolated() {
        let queue = WriteQueue::start();
        let journal = Journal::default();

        queue.enqueue(
            async {
                if true {
                    panic!("boom");
                }
                Ok::<(), String>(())
            },
            Some("panics"),
        );
        queue.enqueue(journal.write("after", 0, false), None);

        queue.shutdown().await;
        assert_eq!(journal.entries(), vec!["after"]);
    }

    #[tokio::test]
    async fn concurrent_producers_never_overlap_writes() {
        let queue = WriteQueue::start();
        let journal = Journal::default();

        let mut producers = Vec::new();
        for _ in 0..8 {
            let handle = queue.handle();
            let journal = journal.clone();
            producers.push(tokio::spawn(async move {
                for _ in 0..4 {
                    handle.enqueue(journal.write("w", 1, false), None);
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        queue.shutdown().await;
        assert_eq!(journal.entries().len(), 32);
        assert_eq!(journal.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn enqueue_after_consumer_stops_is_dropped() {
        let queue = WriteQueue::start();
        let handle = queue.handle();
        queue.worker.abort();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(handle.sender.is_closed());
        handle.enqueue(async { Ok::<(), String>(()) }, Some("late"));
    }
}
