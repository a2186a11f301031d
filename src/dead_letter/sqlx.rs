use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row};
use uuid::Uuid;

use crate::{
    Envelope, MessageId,
    dead_letter::{DeadLetterReason, DeadLetterRecord, DeadLetterSink, SinkError},
};

/// Postgres dead-letter sink.
///
/// Records live in the `dead_letters` table, keyed by message id. Writes use
/// `ON CONFLICT DO NOTHING`, so recording the same id twice keeps the first
/// record and succeeds.
#[derive(Clone)]
pub struct PgDeadLetterSink {
    pool: Pool<sqlx::Postgres>,
}

impl PgDeadLetterSink {
    /// Creates a sink on an existing table.
    pub fn new_uninitialized(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Creates a sink and ensures the table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: sqlx::PgPool) -> Result<Self, Error> {
        create_table(&pool).await?;
        Ok(Self::new_uninitialized(pool))
    }

    /// Oldest `limit` records, in quarantine order.
    #[tracing::instrument(skip(self))]
    pub async fn records(&self, limit: i64) -> Result<Vec<DeadLetterRecord>, Error> {
        let rows = sqlx::query(
            "SELECT message_id, payload, created_at, attempt, max_attempts, reason, quarantined_at
             FROM dead_letters ORDER BY quarantined_at, message_id LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.try_get("message_id")?;
            let payload: Vec<u8> = row.try_get("payload")?;
            let created_at: DateTime<Utc> = row.try_get("created_at")?;
            let attempt: i64 = row.try_get("attempt")?;
            let max_attempts: i64 = row.try_get("max_attempts")?;
            let reason: serde_json::Value = row.try_get("reason")?;
            let quarantined_at: DateTime<Utc> = row.try_get("quarantined_at")?;

            let envelope = Envelope::from_parts(
                MessageId::from(id),
                payload,
                created_at,
                u32::try_from(attempt)?,
                u32::try_from(max_attempts)?,
            );
            out.push(DeadLetterRecord::new(
                envelope,
                serde_json::from_value(reason)?,
                quarantined_at,
            ));
        }

        Ok(out)
    }

    async fn insert(&self, envelope: &Envelope, reason: &DeadLetterReason) -> Result<(), Error> {
        let reason = serde_json::to_value(reason)?;

        sqlx::query(
            "INSERT INTO dead_letters (message_id, payload, created_at, attempt, max_attempts, reason)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (message_id) DO NOTHING",
        )
        .bind(*envelope.id().as_uuid())
        .bind(envelope.payload())
        .bind(envelope.created_at())
        .bind(i64::from(envelope.attempt()))
        .bind(i64::from(envelope.max_attempts()))
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for PgDeadLetterSink {
    #[tracing::instrument(skip_all, fields(id = %envelope.id()))]
    async fn record(
        &self,
        envelope: &Envelope,
        reason: &DeadLetterReason,
    ) -> Result<(), SinkError> {
        self.insert(envelope, reason)
            .await
            .map_err(SinkError::storage_unavailable)
    }
}

/// Ensures the dead-letter table exists.
async fn create_table(pool: &sqlx::PgPool) -> Result<(), Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS dead_letters (
            message_id UUID PRIMARY KEY,
            payload BYTEA NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            attempt BIGINT NOT NULL,
            max_attempts BIGINT NOT NULL,
            reason JSONB NOT NULL,
            quarantined_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp()
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Postgres sink errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    kind: PgSinkErrorKind,
}

/// Kinds of Postgres sink errors.
#[derive(Debug)]
pub enum PgSinkErrorKind {
    Database(sqlx::Error),
    Serde(serde_json::Error),
    /// A stored attempt counter does not fit the envelope.
    Corrupt(std::num::TryFromIntError),
}

impl Error {
    pub fn kind(&self) -> &PgSinkErrorKind {
        &self.kind
    }

    fn new(kind: PgSinkErrorKind) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PgSinkErrorKind::Database(err) => writeln!(f, "Database error: {err}"),
            PgSinkErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
            PgSinkErrorKind::Corrupt(err) => writeln!(f, "Corrupt record: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PgSinkErrorKind::Database(err) => Some(err),
            PgSinkErrorKind::Serde(err) => Some(err),
            PgSinkErrorKind::Corrupt(err) => Some(err),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::new(PgSinkErrorKind::Database(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(PgSinkErrorKind::Serde(err))
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(err: std::num::TryFromIntError) -> Self {
        Self::new(PgSinkErrorKind::Corrupt(err))
    }
}
