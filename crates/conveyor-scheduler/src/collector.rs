//! Log collector: turns executor output streams into ordered, persisted
//! log entries.
//!
//! Stdout and stderr are consumed concurrently and interleave only by
//! wall-clock write time; each (step, kind) keeps its own gapless line
//! counter starting at 0. Persistence is best-effort: a failed write is
//! logged and counted, never propagated into the running pipeline.

use bytes::{Bytes, BytesMut};
use conveyor_core::StepId;
use conveyor_core::executor::{StepExit, StepStreams};
use conveyor_core::log::{LogEntry, LogKind};
use conveyor_store::JobStore;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

pub struct LogCollector {
    store: Arc<dyn JobStore>,
    /// Line counters for side-channel kinds (Metadata/Progress). The
    /// stream kinds keep their counters local to the single task that
    /// consumes each stream.
    side_lines: Mutex<HashMap<(StepId, LogKind), u64>>,
    dropped_writes: AtomicU64,
}

impl LogCollector {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            side_lines: Mutex::new(HashMap::new()),
            dropped_writes: AtomicU64::new(0),
        }
    }

    /// Number of log entries lost to persistence failures.
    pub fn dropped_writes(&self) -> u64 {
        self.dropped_writes.load(Ordering::Relaxed)
    }

    /// Drain both output streams of one step, persisting entries as
    /// they arrive, then record the resolved exit. Returns the exit so
    /// the worker can finalize step status. The two streams are
    /// consumed concurrently; neither blocks the other.
    pub async fn collect(&self, step_id: StepId, streams: StepStreams) -> StepExit {
        tokio::join!(
            self.consume_stream(step_id, LogKind::Stdout, streams.stdout),
            self.consume_stream(step_id, LogKind::Stderr, streams.stderr),
        );

        let exit = streams.exit.await;
        match exit {
            StepExit::Code(code) => {
                // Exactly one exit-code entry per step.
                self.append(step_id, LogKind::ExitCode, 0, Bytes::from(code.to_string()))
                    .await;
            }
            StepExit::Cancelled => {
                self.write_event(step_id, LogKind::Metadata, "cancelled").await;
            }
        }

        self.forget_step(step_id);
        exit
    }

    /// Side-channel entry (Metadata/Progress) with its own per-(step,
    /// kind) counter.
    pub async fn write_event(&self, step_id: StepId, kind: LogKind, payload: impl Into<Bytes>) {
        let line = {
            let mut lines = self
                .side_lines
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let counter = lines.entry((step_id, kind)).or_insert(0);
            let line = *counter;
            *counter += 1;
            line
        };
        self.append(step_id, kind, line, payload.into()).await;
    }

    async fn consume_stream(
        &self,
        step_id: StepId,
        kind: LogKind,
        mut stream: BoxStream<'static, std::io::Result<Bytes>>,
    ) {
        let mut buf = BytesMut::new();
        let mut line = 0u64;

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    buf.extend_from_slice(&bytes);
                    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                        let mut piece = buf.split_to(pos + 1);
                        piece.truncate(piece.len() - 1);
                        self.append(step_id, kind, line, piece.freeze()).await;
                        line += 1;
                    }
                }
                Err(e) => {
                    warn!(step_id = %step_id, kind = %kind, error = %e, "output stream read failed");
                    break;
                }
            }
        }

        // Flush a trailing partial line.
        if !buf.is_empty() {
            self.append(step_id, kind, line, buf.freeze()).await;
        }
    }

    async fn append(&self, step_id: StepId, kind: LogKind, line: u64, payload: Bytes) {
        let entry = LogEntry::new(step_id, kind, line, payload);
        if let Err(e) = self.store.append_log_entry(&entry).await {
            self.dropped_writes.fetch_add(1, Ordering::Relaxed);
            warn!(step_id = %step_id, kind = %kind, error = %e, "dropping log entry after store write failure");
        }
    }

    fn forget_step(&self, step_id: StepId) {
        let mut lines = self
            .side_lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        lines.retain(|(id, _), _| *id != step_id);
    }
}
