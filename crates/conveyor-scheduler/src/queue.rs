//! Bounded FIFO queue holding pipeline jobs until a worker is free.
//!
//! Full-queue policy: bounded blocking with a caller-supplied timeout.
//! `enqueue` waits for capacity up to the timeout and then fails with
//! `QueueFull`; callers (typically synchronous webhook handlers) get a
//! bounded wait instead of an immediate rejection.

use conveyor_core::job::PipelineJob;
use conveyor_core::{Error, Result};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;

pub struct PipelineQueue {
    tx: mpsc::Sender<PipelineJob>,
    rx: Mutex<mpsc::Receiver<PipelineJob>>,
    closed: CancellationToken,
    capacity: usize,
}

impl PipelineQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            closed: CancellationToken::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Accept a job, waiting up to `timeout` for a free slot.
    pub async fn enqueue(&self, job: PipelineJob, timeout: Duration) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::QueueClosed);
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::QueueClosed),
            res = self.tx.send_timeout(job, timeout) => match res {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(_)) => Err(Error::QueueFull),
                Err(SendTimeoutError::Closed(_)) => Err(Error::QueueClosed),
            },
        }
    }

    /// Next job in FIFO order. Returns `None` once the queue is closed;
    /// a call blocked on an empty queue unblocks when `close` fires.
    pub async fn dequeue(&self) -> Option<PipelineJob> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            job = rx.recv() => job,
        }
    }

    /// Stop accepting jobs and unblock in-flight enqueue/dequeue calls.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::job::{GitSource, JobRequest, Trigger};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn job(name: &str) -> PipelineJob {
        PipelineJob::from_request(JobRequest {
            name: name.to_string(),
            source: GitSource::default(),
            trigger: Trigger::Manual,
            env: HashMap::new(),
            steps: vec![],
        })
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = PipelineQueue::new(8);
        for name in ["a", "b", "c"] {
            queue.enqueue(job(name), Duration::from_secs(1)).await.unwrap();
        }

        assert_eq!(queue.dequeue().await.unwrap().name, "a");
        assert_eq!(queue.dequeue().await.unwrap().name, "b");
        assert_eq!(queue.dequeue().await.unwrap().name, "c");
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_blocks_then_times_out() {
        let queue = PipelineQueue::new(2);
        queue.enqueue(job("a"), Duration::from_secs(1)).await.unwrap();
        queue.enqueue(job("b"), Duration::from_secs(1)).await.unwrap();

        // Third enqueue waits for capacity and then fails.
        let err = queue
            .enqueue(job("c"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull));

        // Once a slot frees, enqueue succeeds again.
        queue.dequeue().await.unwrap();
        queue.enqueue(job("c"), Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_enqueue_proceeds_when_slot_frees() {
        let queue = Arc::new(PipelineQueue::new(1));
        queue.enqueue(job("a"), Duration::from_secs(1)).await.unwrap();

        let q = Arc::clone(&queue);
        let pending = tokio::spawn(async move { q.enqueue(job("b"), Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.dequeue().await.unwrap().name, "a");

        pending.await.unwrap().unwrap();
        assert_eq!(queue.dequeue().await.unwrap().name, "b");
    }

    #[tokio::test]
    async fn test_close_rejects_new_jobs() {
        let queue = PipelineQueue::new(2);
        queue.close();
        let err = queue.enqueue(job("a"), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::QueueClosed));
    }

    #[tokio::test]
    async fn test_close_unblocks_dequeue() {
        let queue = Arc::new(PipelineQueue::new(2));
        let q = Arc::clone(&queue);
        let waiting = tokio::spawn(async move { q.dequeue().await });

        tokio::task::yield_now().await;
        queue.close();

        assert!(waiting.await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_unblocks_pending_enqueue() {
        let queue = Arc::new(PipelineQueue::new(1));
        queue.enqueue(job("a"), Duration::from_secs(1)).await.unwrap();

        let q = Arc::clone(&queue);
        let pending = tokio::spawn(async move { q.enqueue(job("b"), Duration::from_secs(60)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.close();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::QueueClosed));
    }
}
