use anyhow::{bail, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{path::Path, thread, time::Duration};

use crate::models::{ChangeProposal, CommitRequest, CommitResult, ConversationTurn, Role};

/**
 * \brief 会话摘要。
 */
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: i64,
    pub title: String,
    pub model_id: String,
}

/**
 * \brief 带主键的发言记录，附带该轮的修改建议（若有）。
 */
#[derive(Debug, Clone)]
pub struct StoredTurn {
    /** \brief 行主键。 */
    pub id: i64,
    pub role: Role,
    pub text: String,
    /** \brief 仅持久化字段，不作为独立实体。 */
    pub proposal: Option<ChangeProposal>,
}

/**
 * \brief 最近提交记录。
 */
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub id: i64,
    pub file_path: String,
    pub commit_message: String,
    pub operation: String,
    pub html_url: String,
    pub created_at: String,
}

/**
 * \brief 打开指定路径的历史数据库。
 */
pub fn open_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            model_id TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS turns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL REFERENCES sessions(id),
            role TEXT NOT NULL,
            text TEXT NOT NULL,
            proposal_json TEXT
        );

        CREATE TABLE IF NOT EXISTS commits (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_path TEXT NOT NULL,
            commit_message TEXT NOT NULL,
            operation TEXT NOT NULL,
            html_url TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        "#,
        )
    })?;
    Ok(())
}

/**
 * \brief 创建会话。
 */
pub fn create_session(conn: &Connection, title: &str, model_id: &str) -> Result<i64> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO sessions (title, model_id) VALUES (?1, ?2)",
            params![title, model_id],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 按 ID 读取会话。
 */
pub fn get_session(conn: &Connection, id: i64) -> Result<Option<SessionSummary>> {
    conn.query_row(
        "SELECT id, title, model_id FROM sessions WHERE id=?1",
        params![id],
        |row| {
            Ok(SessionSummary {
                id: row.get(0)?,
                title: row.get(1)?,
                model_id: row.get(2)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 列出全部会话，新会话在前。
 */
pub fn list_sessions(conn: &Connection) -> Result<Vec<SessionSummary>> {
    let mut stmt = conn.prepare("SELECT id, title, model_id FROM sessions ORDER BY id DESC")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(SessionSummary {
                id: row.get(0)?,
                title: row.get(1)?,
                model_id: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 更新会话所用模型。
 */
pub fn set_session_model(conn: &Connection, id: i64, model_id: &str) -> Result<()> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE sessions SET model_id=?1 WHERE id=?2",
            params![model_id, id],
        )
    })?;
    if rows == 0 {
        bail!("session id {} not found", id);
    }
    Ok(())
}

/**
 * \brief 追加一轮发言（只追加，不修改既有记录）。
 */
pub fn append_turn(
    conn: &Connection,
    session_id: i64,
    role: Role,
    text: &str,
    proposal: Option<&ChangeProposal>,
) -> Result<i64> {
    let proposal_json = proposal.map(serde_json::to_string).transpose()?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO turns (session_id, role, text, proposal_json) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, role.as_str(), text, proposal_json],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 读取会话全部发言，用作下一轮的历史。
 */
pub fn load_turns(conn: &Connection, session_id: i64) -> Result<Vec<ConversationTurn>> {
    Ok(load_turns_with_meta(conn, session_id)?
        .into_iter()
        .map(|t| ConversationTurn {
            role: t.role,
            text: t.text,
        })
        .collect())
}

/**
 * \brief 读取带主键与建议的发言，用于展示。
 */
pub fn load_turns_with_meta(conn: &Connection, session_id: i64) -> Result<Vec<StoredTurn>> {
    let mut stmt = conn.prepare(
        "SELECT id, role, text, proposal_json FROM turns WHERE session_id=?1 ORDER BY id ASC",
    )?;
    let raw = stmt
        .query_map(params![session_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut turns = Vec::with_capacity(raw.len());
    for (id, role, text, proposal_json) in raw {
        let Some(role) = Role::parse(&role) else {
            bail!("turn {} has unknown role {:?}", id, role);
        };
        // 旧记录中的建议若无法解码则忽略，不影响历史读取
        let proposal = proposal_json.and_then(|s| serde_json::from_str(&s).ok());
        turns.push(StoredTurn {
            id,
            role,
            text,
            proposal,
        });
    }
    Ok(turns)
}

/**
 * \brief 记录一次成功提交。
 */
pub fn record_commit(conn: &Connection, request: &CommitRequest, result: &CommitResult) -> Result<i64> {
    let operation = serde_json::to_value(result.operation)?
        .as_str()
        .unwrap_or_default()
        .to_string();
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO commits (file_path, commit_message, operation, html_url) VALUES (?1, ?2, ?3, ?4)",
            params![
                request.normalized_path(),
                request.commit_message,
                operation,
                result.html_url
            ],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 最近提交，新记录在前。
 */
pub fn recent_commits(conn: &Connection, limit: usize) -> Result<Vec<CommitRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, file_path, commit_message, operation, html_url, created_at FROM commits ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok(CommitRecord {
                id: row.get(0)?,
                file_path: row.get(1)?,
                commit_message: row.get(2)?,
                operation: row.get(3)?,
                html_url: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行线性退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}
