//! SQLite 持久化存储（async-sqlite feature）
//!
//! 任务以 JSON 整体存入 body 列，另冗余 status / priority / created_at / lease_expires_at 供认领排序。
//! 每次迁移：读出 (body, rev) -> 在内存中 Task::apply -> `UPDATE ... WHERE id = ? AND rev = ?`，
//! rows_affected 为 0 说明被并发修改，重读后重试（乐观 CAS）。

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::{broadcast, Mutex};

use super::bus::EventBus;
use super::types::{
    Event, EventType, MessageRole, Task, TaskId, TaskStatus, Thread, ThreadMessage, ThreadMetadata, Transition,
};
use super::{now_millis, Store, StoreError};

/// CAS 冲突后的最大重试次数
const MAX_CAS_RETRIES: usize = 16;

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub struct SqliteStore {
    pool: SqlitePool,
    bus: EventBus,
    /// 串行化本进程内的事件追加，使推送顺序与 seq 一致
    append_lock: Mutex<()>,
}

impl SqliteStore {
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(backend)?;
            }
        }
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&db_url)
            .await
            .map_err(backend)?;

        let statements = [
            "PRAGMA journal_mode = WAL",
            "PRAGMA busy_timeout = 5000",
            "CREATE TABLE IF NOT EXISTS threads (
                id TEXT PRIMARY KEY,
                subject TEXT NOT NULL,
                metadata TEXT NOT NULL,
                context TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS thread_messages (
                thread_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                task_id TEXT,
                PRIMARY KEY (thread_id, seq)
            )",
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                lease_expires_at INTEGER,
                rev INTEGER NOT NULL DEFAULT 0,
                body TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(status, priority, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_thread ON tasks(thread_id)",
            "CREATE TABLE IF NOT EXISTS events (
                thread_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                task_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                message TEXT NOT NULL,
                event_type TEXT NOT NULL,
                metadata TEXT NOT NULL,
                PRIMARY KEY (thread_id, seq)
            )",
            "CREATE INDEX IF NOT EXISTS idx_events_task ON events(task_id)",
        ];
        for sql in statements {
            sqlx::query(sql).execute(&pool).await.map_err(backend)?;
        }

        tracing::info!(path = %db_path.as_ref().display(), "SQLite store opened");
        Ok(Self {
            pool,
            bus: EventBus::new(),
            append_lock: Mutex::new(()),
        })
    }

    async fn load_task(&self, task_id: &str) -> Result<Option<(Task, i64)>, StoreError> {
        let row = sqlx::query("SELECT body, rev FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|r| decode_task_row(&r)).transpose()
    }

    /// CAS 写回：rev 不匹配返回 false
    async fn store_task(&self, task: &Task, rev: i64) -> Result<bool, StoreError> {
        let body = serde_json::to_string(task).map_err(backend)?;
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, lease_expires_at = ?, body = ?, rev = rev + 1
             WHERE id = ? AND rev = ?",
        )
        .bind(task.status.as_str())
        .bind(task.lease_expires_at)
        .bind(&body)
        .bind(&task.id)
        .bind(rev)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn thread_exists(&self, thread_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM threads WHERE id = ?")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.is_some())
    }
}

fn decode_task_row(row: &sqlx::sqlite::SqliteRow) -> Result<(Task, i64), StoreError> {
    let body: String = row.try_get("body").map_err(backend)?;
    let rev: i64 = row.try_get("rev").map_err(backend)?;
    let task: Task = serde_json::from_str(&body).map_err(backend)?;
    Ok((task, rev))
}

fn decode_event_row(row: &sqlx::sqlite::SqliteRow) -> Result<Event, StoreError> {
    let event_type: String = row.try_get("event_type").map_err(backend)?;
    let metadata: String = row.try_get("metadata").map_err(backend)?;
    Ok(Event {
        seq: row.try_get::<i64, _>("seq").map_err(backend)? as u64,
        thread_id: row.try_get("thread_id").map_err(backend)?,
        task_id: row.try_get("task_id").map_err(backend)?,
        timestamp: row.try_get("timestamp").map_err(backend)?,
        message: row.try_get("message").map_err(backend)?,
        event_type: event_type.parse::<EventType>().map_err(backend)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_thread(&self, thread: Thread) -> Result<(), StoreError> {
        let metadata = serde_json::to_string(&thread.metadata).map_err(backend)?;
        let context = serde_json::to_string(&thread.context).map_err(backend)?;
        sqlx::query("INSERT INTO threads (id, subject, metadata, context) VALUES (?, ?, ?, ?)")
            .bind(&thread.id)
            .bind(&thread.subject)
            .bind(&metadata)
            .bind(&context)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        for message in thread.messages {
            self.append_message(&thread.id, message).await?;
        }
        Ok(())
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, StoreError> {
        let Some(row) = sqlx::query("SELECT id, subject, metadata, context FROM threads WHERE id = ?")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
        else {
            return Ok(None);
        };

        let metadata: String = row.try_get("metadata").map_err(backend)?;
        let context: String = row.try_get("context").map_err(backend)?;
        let mut thread = Thread {
            id: row.try_get("id").map_err(backend)?,
            subject: row.try_get("subject").map_err(backend)?,
            messages: Vec::new(),
            metadata: serde_json::from_str::<ThreadMetadata>(&metadata).map_err(backend)?,
            context: serde_json::from_str::<BTreeMap<String, String>>(&context).map_err(backend)?,
        };

        let rows = sqlx::query(
            "SELECT role, content, timestamp, task_id FROM thread_messages
             WHERE thread_id = ? ORDER BY seq ASC",
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        for row in rows {
            let role: String = row.try_get("role").map_err(backend)?;
            thread.messages.push(ThreadMessage {
                role: role.parse::<MessageRole>().map_err(backend)?,
                content: row.try_get("content").map_err(backend)?,
                timestamp: row.try_get("timestamp").map_err(backend)?,
                task_id: row.try_get("task_id").map_err(backend)?,
            });
        }
        Ok(Some(thread))
    }

    async fn append_message(&self, thread_id: &str, message: ThreadMessage) -> Result<(), StoreError> {
        if !self.thread_exists(thread_id).await? {
            return Err(StoreError::thread_not_found(thread_id));
        }
        let mut conn = self.pool.begin().await.map_err(backend)?;
        // 时间戳不早于线程最后一条消息，追加顺序即时间顺序
        let row = sqlx::query(
            "INSERT INTO thread_messages (thread_id, seq, role, content, timestamp, task_id)
             SELECT ?, COALESCE(MAX(seq), 0) + 1, ?, ?, MAX(?, COALESCE(MAX(timestamp), ?)), ?
             FROM thread_messages WHERE thread_id = ?
             RETURNING timestamp",
        )
        .bind(thread_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.timestamp)
        .bind(message.timestamp)
        .bind(&message.task_id)
        .bind(thread_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(backend)?;
        let timestamp: i64 = row.try_get("timestamp").map_err(backend)?;

        sqlx::query(
            "UPDATE threads SET metadata = json_set(metadata, '$.updated_at',
                 MAX(COALESCE(json_extract(metadata, '$.updated_at'), 0), ?))
             WHERE id = ?",
        )
        .bind(timestamp)
        .bind(thread_id)
        .execute(&mut *conn)
        .await
        .map_err(backend)?;
        conn.commit().await.map_err(backend)
    }

    /// 单条 UPDATE 内合并，并发合并不会互相覆盖
    async fn merge_context(
        &self,
        thread_id: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let patch = serde_json::to_string(context).map_err(backend)?;
        let updated = sqlx::query("UPDATE threads SET context = json_patch(context, ?) WHERE id = ?")
            .bind(patch)
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::thread_not_found(thread_id));
        }
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        sqlx::query("DELETE FROM events WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        sqlx::query("DELETE FROM thread_messages WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        let result = sqlx::query("DELETE FROM threads WHERE id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        self.bus.close(thread_id);
        Ok(result.rows_affected() > 0)
    }

    async fn insert_task(&self, task: Task) -> Result<(), StoreError> {
        if !self.thread_exists(&task.thread_id).await? {
            return Err(StoreError::thread_not_found(&task.thread_id));
        }
        let body = serde_json::to_string(&task).map_err(backend)?;
        sqlx::query(
            "INSERT INTO tasks (id, thread_id, status, priority, created_at, lease_expires_at, rev, body)
             VALUES (?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(&task.id)
        .bind(&task.thread_id)
        .bind(task.status.as_str())
        .bind(task.priority as i64)
        .bind(task.created_at)
        .bind(task.lease_expires_at)
        .bind(&body)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.load_task(task_id).await?.map(|(task, _)| task))
    }

    async fn tasks_for_thread(&self, thread_id: &str) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query("SELECT body, rev FROM tasks WHERE thread_id = ? ORDER BY created_at ASC")
            .bind(thread_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(|r| decode_task_row(r).map(|(t, _)| t)).collect()
    }

    async fn delete_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let existing = self.get_task(task_id).await?;
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(existing)
    }

    async fn claim_next(&self, worker_id: &str, lease_ms: i64, now: i64) -> Result<Option<Task>, StoreError> {
        for _ in 0..MAX_CAS_RETRIES {
            let row = sqlx::query(
                "SELECT body, rev FROM tasks
                 WHERE status = 'queued'
                    OR (status = 'running' AND (lease_expires_at IS NULL OR lease_expires_at <= ?))
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT 1",
            )
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

            let Some(row) = row else {
                return Ok(None);
            };
            let (mut task, rev) = decode_task_row(&row)?;
            task.apply(
                &Transition::Claim {
                    worker_id: worker_id.to_string(),
                    lease_ms,
                },
                now,
            )?;
            if self.store_task(&task, rev).await? {
                return Ok(Some(task));
            }
            // 被其它 Worker 抢先，重新挑选
        }
        Err(StoreError::Backend("claim contention: too many CAS retries".to_string()))
    }

    async fn transition(&self, task_id: &str, transition: Transition, now: i64) -> Result<Task, StoreError> {
        for _ in 0..MAX_CAS_RETRIES {
            let (mut task, rev) = self
                .load_task(task_id)
                .await?
                .ok_or_else(|| StoreError::task_not_found(task_id))?;
            task.apply(&transition, now)?;
            if self.store_task(&task, rev).await? {
                return Ok(task);
            }
        }
        Err(StoreError::Backend(format!("task {task_id}: too many CAS retries")))
    }

    async fn requeue_expired(&self, now: i64) -> Result<Vec<TaskId>, StoreError> {
        let rows = sqlx::query(
            "SELECT id FROM tasks WHERE status = 'running' AND (lease_expires_at IS NULL OR lease_expires_at <= ?)",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut requeued = Vec::new();
        for row in rows {
            let id: String = row.try_get("id").map_err(backend)?;
            match self.transition(&id, Transition::Expire, now).await {
                Ok(task) if task.status == TaskStatus::Queued => requeued.push(id),
                Ok(_) => {}
                // 并发下已被续约或认领
                Err(StoreError::Transition(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(requeued)
    }

    async fn append_event(&self, event: Event) -> Result<Event, StoreError> {
        if !self.thread_exists(&event.thread_id).await? {
            return Err(StoreError::thread_not_found(&event.thread_id));
        }
        let metadata = serde_json::to_string(&event.metadata).map_err(backend)?;
        let _guard = self.append_lock.lock().await;
        let row = sqlx::query(
            "INSERT INTO events (thread_id, seq, task_id, timestamp, message, event_type, metadata)
             SELECT ?, COALESCE(MAX(seq), 0) + 1, ?, ?, ?, ?, ? FROM events WHERE thread_id = ?
             RETURNING seq",
        )
        .bind(&event.thread_id)
        .bind(&event.task_id)
        .bind(event.timestamp)
        .bind(&event.message)
        .bind(event.event_type.as_str())
        .bind(&metadata)
        .bind(&event.thread_id)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        let mut event = event;
        event.seq = row.try_get::<i64, _>("seq").map_err(backend)? as u64;
        self.bus.publish(&event);
        Ok(event)
    }

    async fn events_for_task(&self, task_id: &str) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query("SELECT * FROM events WHERE task_id = ? ORDER BY seq ASC")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(decode_event_row).collect()
    }

    async fn events_for_thread(&self, thread_id: &str, after_seq: u64) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query("SELECT * FROM events WHERE thread_id = ? AND seq > ? ORDER BY seq ASC")
            .bind(thread_id)
            .bind(after_seq as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(decode_event_row).collect()
    }

    fn subscribe(&self, thread_id: &str) -> broadcast::Receiver<Event> {
        self.bus.subscribe(thread_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Strategy;

    async fn open_temp() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("triage.db")).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_task_roundtrip_and_claim() {
        let (store, _dir) = open_temp().await;
        let thread = Thread::new("memory pressure");
        store.insert_thread(thread.clone()).await.unwrap();
        let task = Task::new(&thread.id, "why is memory high", Strategy::Direct);
        store.insert_task(task.clone()).await.unwrap();

        let now = now_millis();
        let claimed = store.claim_next("w1", 5_000, now).await.unwrap().unwrap();
        assert_eq!(claimed.id, task.id);
        assert_eq!(claimed.status, TaskStatus::Running);
        assert!(store.claim_next("w2", 5_000, now).await.unwrap().is_none());

        let done = store
            .transition(
                &task.id,
                Transition::Complete {
                    worker_id: "w1".into(),
                    result: "fine".into(),
                },
                now + 1,
            )
            .await
            .unwrap();
        assert_eq!(done.result.as_deref(), Some("fine"));
        assert_eq!(store.get_task(&task.id).await.unwrap().unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_messages_and_events_ordered() {
        let (store, _dir) = open_temp().await;
        let thread = Thread::new("s");
        store.insert_thread(thread.clone()).await.unwrap();
        store.append_message(&thread.id, ThreadMessage::user("a")).await.unwrap();
        store.append_message(&thread.id, ThreadMessage::assistant("b")).await.unwrap();

        for msg in ["one", "two"] {
            let mut e = Event::new(EventType::Response, msg);
            e.thread_id = thread.id.clone();
            e.task_id = "t".into();
            store.append_event(e).await.unwrap();
        }

        let loaded = store.get_thread(&thread.id).await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[1].content, "b");
        let events = store.events_for_thread(&thread.id, 0).await.unwrap();
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(store.events_for_task("t").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_message_timestamps_never_go_backwards() {
        let (store, _dir) = open_temp().await;
        let thread = Thread::new("s");
        store.insert_thread(thread.clone()).await.unwrap();

        let mut late = ThreadMessage::user("first");
        late.timestamp = 5_000;
        store.append_message(&thread.id, late).await.unwrap();
        let mut early = ThreadMessage::assistant("second");
        early.timestamp = 1_000;
        store.append_message(&thread.id, early).await.unwrap();

        let loaded = store.get_thread(&thread.id).await.unwrap().unwrap();
        assert_eq!(loaded.messages[1].timestamp, 5_000);
        assert!(loaded.metadata.updated_at >= 5_000);
        assert!(matches!(
            store.append_message("thread_missing", ThreadMessage::user("x")).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_context_merges_keep_every_key() {
        let (store, _dir) = open_temp().await;
        let store = std::sync::Arc::new(store);
        let thread = Thread::new("s");
        store.insert_thread(thread.clone()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let thread_id = thread.id.clone();
            handles.push(tokio::spawn(async move {
                let ctx = BTreeMap::from([(format!("key_{i}"), format!("value_{i}"))]);
                store.merge_context(&thread_id, &ctx).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let loaded = store.get_thread(&thread.id).await.unwrap().unwrap();
        assert_eq!(loaded.context.len(), 8);
        assert_eq!(loaded.context.get("key_3").map(String::as_str), Some("value_3"));
        assert!(store.merge_context("thread_missing", &BTreeMap::new()).await.is_err());
    }
}
