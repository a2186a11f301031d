use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::{
    Envelope, MessageId,
    dead_letter::{DeadLetterReason, DeadLetterRecord, DeadLetterSink, SinkError},
};

/// An in-memory dead-letter sink for testing or local usage.
///
/// Records are kept in insertion order. Outages can be simulated with
/// [`fail_next_writes`](InMemoryDeadLetterSink::fail_next_writes).
#[derive(Clone, Default)]
pub struct InMemoryDeadLetterSink {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    records: Vec<DeadLetterRecord>,
    ids: HashSet<MessageId>,
    failing_writes: usize,
}

impl InMemoryDeadLetterSink {
    /// Snapshot of all stored records, oldest first.
    pub async fn records(&self) -> Vec<DeadLetterRecord> {
        self.inner.lock().await.records.clone()
    }

    pub async fn contains(&self, id: &MessageId) -> bool {
        self.inner.lock().await.ids.contains(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Make the next `count` writes fail with a storage-unavailable error.
    pub async fn fail_next_writes(&self, count: usize) {
        self.inner.lock().await.failing_writes = count;
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    #[tracing::instrument(skip_all, fields(id = %envelope.id()))]
    async fn record(
        &self,
        envelope: &Envelope,
        reason: &DeadLetterReason,
    ) -> Result<(), SinkError> {
        let mut inner = self.inner.lock().await;

        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(SinkError::storage_unavailable(InMemorySinkError::Unavailable));
        }

        if !inner.ids.insert(envelope.id()) {
            tracing::debug!("Message already dead-lettered");
            return Ok(());
        }

        inner.records.push(DeadLetterRecord::new(
            envelope.clone(),
            reason.clone(),
            Utc::now(),
        ));
        Ok(())
    }
}

/// Simulated failure of the in-memory sink.
#[derive(Debug)]
enum InMemorySinkError {
    Unavailable,
}

impl std::fmt::Display for InMemorySinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InMemorySinkError::Unavailable => write!(f, "In-memory sink is unavailable"),
        }
    }
}

impl std::error::Error for InMemorySinkError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dead_letter::SinkErrorKind, outcome::FailureReason};

    #[tokio::test]
    async fn recording_the_same_id_twice_keeps_one_record() {
        let sink = InMemoryDeadLetterSink::default();
        let envelope = Envelope::new(b"poison".to_vec(), 1);

        sink.record(&envelope, &DeadLetterReason::MaxAttemptsExceeded)
            .await
            .unwrap();
        sink.record(
            &envelope,
            &DeadLetterReason::FatalFailure(FailureReason::HandlerCrashed),
        )
        .await
        .unwrap();

        let records = sink.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].envelope(), &envelope);
        assert_eq!(records[0].reason(), &DeadLetterReason::MaxAttemptsExceeded);
    }

    #[tokio::test]
    async fn simulated_outage_rejects_then_recovers() {
        let sink = InMemoryDeadLetterSink::default();
        let envelope = Envelope::new(Vec::new(), 0);
        sink.fail_next_writes(1).await;

        let err = sink
            .record(&envelope, &DeadLetterReason::MaxAttemptsExceeded)
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), SinkErrorKind::StorageUnavailable(_)));
        assert!(!sink.contains(&envelope.id()).await);

        sink.record(&envelope, &DeadLetterReason::MaxAttemptsExceeded)
            .await
            .unwrap();
        assert!(sink.contains(&envelope.id()).await);
    }
}
