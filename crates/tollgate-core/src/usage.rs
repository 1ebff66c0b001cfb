use rusqlite::Connection;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::error;

/// `(principal, date, model, endpoint, prompt_tokens, completion_tokens, total_tokens)`.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub principal_key: String,
    pub date: String,
    pub model: String,
    pub endpoint: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl UsageRecord {
    pub fn is_recordable(&self) -> bool {
        !self.model.is_empty() && self.model != "unknown" && self.total_tokens > 0
    }
}

enum Message {
    Record(UsageRecord),
    Flush(tokio::sync::oneshot::Sender<()>),
}

/// Append-only SQLite usage log. Writes never block the request: `record`
/// only pushes onto an unbounded channel drained by a single background
/// writer task, mirroring the teacher's `EventHub::emit` -- fire the event,
/// let a background consumer do the I/O, never make the caller wait on it.
#[derive(Clone)]
pub struct UsageSink {
    tx: mpsc::UnboundedSender<Message>,
}

impl UsageSink {
    pub fn start(db_path: impl Into<String>) -> anyhow::Result<Self> {
        let db_path = db_path.into();
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS usage_records (
                principal_key TEXT NOT NULL,
                date TEXT NOT NULL,
                model TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_usage_records_principal_date
                ON usage_records(principal_key, date);",
        )?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        std::thread::spawn(move || {
            while let Some(message) = rx.blocking_recv() {
                match message {
                    Message::Record(record) => {
                        if let Err(err) = insert(&conn, &record) {
                            error!(target: "tollgate::usage", error = %err, "failed to persist usage record");
                        }
                    }
                    Message::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });

        Ok(Self { tx })
    }

    /// Fire-and-forget: never blocks, never fails the request. A full or
    /// closed channel silently drops the record (logged, not propagated).
    pub fn record(&self, record: UsageRecord) {
        if !record.is_recordable() {
            return;
        }
        if self.tx.send(Message::Record(record)).is_err() {
            error!(target: "tollgate::usage", "usage sink writer task is gone, dropping record");
        }
    }

    /// Waits for every record enqueued before this call to be written. The
    /// channel's FIFO order guarantees the flush ack is only sent once the
    /// writer thread has drained everything queued ahead of it.
    pub async fn flush(&self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self.tx.send(Message::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

fn insert(conn: &Connection, record: &UsageRecord) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO usage_records
            (principal_key, date, model, endpoint, prompt_tokens, completion_tokens, total_tokens)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            record.principal_key,
            record.date,
            record.model,
            record.endpoint,
            record.prompt_tokens,
            record.completion_tokens,
            record.total_tokens,
        ],
    )?;
    Ok(())
}

pub fn today_utc() -> String {
    let date = OffsetDateTime::now_utc().date();
    format!("{:04}-{:02}-{:02}", date.year(), u8::from(date.month()), date.day())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn records_are_persisted_by_background_writer() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("usage.sqlite3");
        let sink = UsageSink::start(db_path.to_string_lossy().to_string()).unwrap();

        sink.record(UsageRecord {
            principal_key: "user-1".to_string(),
            date: "2026-07-31".to_string(),
            model: "gpt-4o-mini".to_string(),
            endpoint: "/v1/chat/completions".to_string(),
            prompt_tokens: 2,
            completion_tokens: 3,
            total_tokens: 5,
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let conn = Connection::open(&db_path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM usage_records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn unrecordable_records_are_skipped() {
        let record = UsageRecord {
            principal_key: "user-1".to_string(),
            date: "2026-07-31".to_string(),
            model: "unknown".to_string(),
            endpoint: "/v1/chat/completions".to_string(),
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
        };
        assert!(!record.is_recordable());
    }
}
