use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

/// Entries kept in memory per session; older history lives only in SQLite.
pub const RING_CAPACITY: usize = 100;

const WRITER_QUEUE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    User,
    Assistant,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::User => "user",
            Direction::Assistant => "assistant",
        }
    }

    fn parse(raw: &str) -> Self {
        if raw == "assistant" {
            Direction::Assistant
        } else {
            Direction::User
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub session: String,
    pub direction: Direction,
    pub text: String,
    pub ts: DateTime<Utc>,
}

enum WriterMsg {
    Append {
        session: String,
        seq: i64,
        direction: Direction,
        text: String,
        ts: i64,
    },
    Clear(Option<String>),
    Flush(oneshot::Sender<()>),
}

/// Append-only conversation log: a bounded in-memory ring per session plus a
/// durable SQLite table behind a single writer task. Appends never block the
/// worker path; durable failures are logged and dropped.
pub struct HistoryStore {
    db: Arc<Mutex<Connection>>,
    rings: StdMutex<HashMap<String, VecDeque<(i64, HistoryEntry)>>>,
    next_seq: StdMutex<HashMap<String, i64>>,
    tx: mpsc::Sender<WriterMsg>,
}

impl HistoryStore {
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS history (
                session_name TEXT NOT NULL,
                seq INTEGER NOT NULL,
                direction TEXT NOT NULL,
                text TEXT NOT NULL,
                ts INTEGER NOT NULL,
                PRIMARY KEY (session_name, seq)
            )",
            [],
        )?;

        // Resume per-session counters so restarts keep appending, not clobbering.
        let mut next_seq = HashMap::new();
        {
            let mut stmt =
                conn.prepare("SELECT session_name, MAX(seq) FROM history GROUP BY session_name")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (session, max_seq) = row?;
                next_seq.insert(session, max_seq);
            }
        }

        let db = Arc::new(Mutex::new(conn));
        let (tx, rx) = mpsc::channel(WRITER_QUEUE);
        tokio::spawn(writer_loop(db.clone(), rx));

        info!("history store ready at {}", db_path.display());
        Ok(Self {
            db,
            rings: StdMutex::new(HashMap::new()),
            next_seq: StdMutex::new(next_seq),
            tx,
        })
    }

    /// Fire-and-forget append. The ring is updated synchronously, the durable
    /// row goes through the writer queue.
    pub fn append(&self, session: &str, direction: Direction, text: &str) {
        let ts = Utc::now();
        let seq = {
            let mut seqs = self.next_seq.lock().expect("seq lock");
            let counter = seqs.entry(session.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };

        let entry = HistoryEntry {
            session: session.to_string(),
            direction,
            text: text.to_string(),
            ts,
        };
        {
            let mut rings = self.rings.lock().expect("ring lock");
            let ring = rings.entry(session.to_string()).or_default();
            ring.push_back((seq, entry));
            while ring.len() > RING_CAPACITY {
                ring.pop_front();
            }
        }

        let msg = WriterMsg::Append {
            session: session.to_string(),
            seq,
            direction,
            text: text.to_string(),
            ts: ts.timestamp(),
        };
        if self.tx.try_send(msg).is_err() {
            warn!("history writer queue full, dropping durable append");
        }
    }

    /// Most recent `n` entries for a session: durable rows first, the
    /// in-memory ring for the newest tail.
    pub async fn recent(&self, session: &str, n: usize) -> Vec<HistoryEntry> {
        let (ring_tail, min_seq): (Vec<HistoryEntry>, i64) = {
            let rings = self.rings.lock().expect("ring lock");
            match rings.get(session) {
                Some(ring) => {
                    let take = ring.len().min(n);
                    let tail: Vec<_> = ring
                        .iter()
                        .skip(ring.len() - take)
                        .map(|(_, e)| e.clone())
                        .collect();
                    let min = ring
                        .iter()
                        .skip(ring.len() - take)
                        .map(|(seq, _)| *seq)
                        .next()
                        .unwrap_or(i64::MAX);
                    (tail, min)
                }
                None => (Vec::new(), i64::MAX),
            }
        };

        let need = n.saturating_sub(ring_tail.len());
        if need == 0 {
            return ring_tail;
        }

        let older = self
            .durable_before(session, min_seq, need)
            .await
            .unwrap_or_else(|e| {
                warn!("history read failed: {}", e);
                Vec::new()
            });

        let mut merged = older;
        merged.extend(ring_tail);
        merged
    }

    async fn durable_before(
        &self,
        session: &str,
        before_seq: i64,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT direction, text, ts FROM history
             WHERE session_name = ?1 AND seq < ?2
             ORDER BY seq DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![session, before_seq, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (direction, text, ts) = row?;
            out.push(HistoryEntry {
                session: session.to_string(),
                direction: Direction::parse(&direction),
                text,
                ts: DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now),
            });
        }
        out.reverse();
        Ok(out)
    }

    /// Drop history for one session, or for all when `session` is `None`.
    /// Ordered behind pending appends through the writer queue.
    pub fn clear(&self, session: Option<&str>) {
        {
            let mut rings = self.rings.lock().expect("ring lock");
            let mut seqs = self.next_seq.lock().expect("seq lock");
            match session {
                Some(name) => {
                    rings.remove(name);
                    seqs.remove(name);
                }
                None => {
                    rings.clear();
                    seqs.clear();
                }
            }
        }
        let msg = WriterMsg::Clear(session.map(|s| s.to_string()));
        if self.tx.try_send(msg).is_err() {
            warn!("history writer queue full, dropping clear");
        }
    }

    /// Wait until every queued write has hit the database.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(WriterMsg::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn writer_loop(db: Arc<Mutex<Connection>>, mut rx: mpsc::Receiver<WriterMsg>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            WriterMsg::Append {
                session,
                seq,
                direction,
                text,
                ts,
            } => {
                let db = db.lock().await;
                let res = db.execute(
                    "INSERT OR REPLACE INTO history (session_name, seq, direction, text, ts)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![session, seq, direction.as_str(), text, ts],
                );
                if let Err(e) = res {
                    warn!("history append failed (dropped): {}", e);
                }
            }
            WriterMsg::Clear(session) => {
                let db = db.lock().await;
                let res = match session {
                    Some(name) => {
                        db.execute("DELETE FROM history WHERE session_name = ?1", params![name])
                    }
                    None => db.execute("DELETE FROM history", []),
                };
                if let Err(e) = res {
                    warn!("history clear failed: {}", e);
                }
            }
            WriterMsg::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> HistoryStore {
        HistoryStore::new(&dir.path().join("history.db")).unwrap()
    }

    #[tokio::test]
    async fn successful_ask_appends_user_then_assistant() {
        let tmp = tempfile::tempdir().unwrap();
        let history = store(&tmp);

        history.append("main", Direction::User, "hello");
        history.append("main", Direction::Assistant, "hi there");
        history.flush().await;

        let recent = history.recent("main", 10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].direction, Direction::User);
        assert_eq!(recent[1].direction, Direction::Assistant);
        assert_eq!(recent[1].text, "hi there");
    }

    #[tokio::test]
    async fn ring_is_bounded_and_overflow_reads_come_from_sqlite() {
        let tmp = tempfile::tempdir().unwrap();
        let history = store(&tmp);

        for i in 0..RING_CAPACITY + 20 {
            history.append("main", Direction::User, &format!("msg-{}", i));
        }
        history.flush().await;

        {
            let rings = history.rings.lock().unwrap();
            assert_eq!(rings.get("main").unwrap().len(), RING_CAPACITY);
        }

        let all = history.recent("main", RING_CAPACITY + 20).await;
        assert_eq!(all.len(), RING_CAPACITY + 20);
        assert_eq!(all[0].text, "msg-0");
        assert_eq!(all.last().unwrap().text, format!("msg-{}", RING_CAPACITY + 19));
    }

    #[tokio::test]
    async fn clear_removes_ring_and_durable_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let history = store(&tmp);

        history.append("main", Direction::User, "a");
        history.append("other", Direction::User, "b");
        history.flush().await;

        history.clear(Some("main"));
        history.flush().await;

        assert!(history.recent("main", 10).await.is_empty());
        assert_eq!(history.recent("other", 10).await.len(), 1);

        history.clear(None);
        history.flush().await;
        assert!(history.recent("other", 10).await.is_empty());
    }

    #[tokio::test]
    async fn sessions_do_not_mix() {
        let tmp = tempfile::tempdir().unwrap();
        let history = store(&tmp);

        history.append("alpha", Direction::User, "to alpha");
        history.append("beta", Direction::User, "to beta");
        history.flush().await;

        let alpha = history.recent("alpha", 10).await;
        assert_eq!(alpha.len(), 1);
        assert_eq!(alpha[0].session, "alpha");
        assert_eq!(alpha[0].text, "to alpha");
    }
}
