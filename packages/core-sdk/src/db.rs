use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde_json::{Map, Value};
use std::{sync::Mutex, thread, time::Duration};

use crate::models::{AiConfigRecord, InteractionRecord, Principal, AI_CONFIG_SECTION};
use crate::store::{ContentStore, IdentityProvider};
use crate::telemetry;

/**
 * \brief 打开指定路径的数据库文件。
 */
pub fn open_db(path: &str) -> Result<Connection> {
    let conn = Connection::open(path).with_context(|| format!("open database {}", path))?;
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
        CREATE TABLE IF NOT EXISTS site_content (
            section TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS user_roles (
            user_id TEXT NOT NULL,
            role TEXT NOT NULL,
            PRIMARY KEY (user_id, role)
        );

        CREATE TABLE IF NOT EXISTS auth_tokens (
            token TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            email TEXT,
            user_metadata TEXT NOT NULL DEFAULT '{}',
            app_metadata TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS ai_interactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            note_id TEXT,
            action TEXT NOT NULL,
            prompt_chars INTEGER NOT NULL,
            response_chars INTEGER NOT NULL,
            succeeded INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

/**
 * \brief 读取指定 section 的 JSON 内容。
 */
pub fn get_section(conn: &Connection, section: &str) -> Result<Option<Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT content FROM site_content WHERE section=?1",
            params![section],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => Ok(Some(
            serde_json::from_str(&text)
                .with_context(|| format!("section {} holds invalid JSON", section))?,
        )),
        None => Ok(None),
    }
}

/**
 * \brief 写入（upsert）指定 section 的 JSON 内容。
 */
pub fn put_section(conn: &Connection, section: &str, content: &Value) -> Result<()> {
    let text = serde_json::to_string(content)?;
    let now = telemetry::now_rfc3339();
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO site_content (section, content, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(section) DO UPDATE
             SET content=excluded.content, updated_at=excluded.updated_at",
            params![section, text, now],
        )
    })?;
    Ok(())
}

/**
 * \brief 为用户授予角色（重复授予无副作用）。
 */
pub fn grant_role(conn: &Connection, user_id: &str, role: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT OR IGNORE INTO user_roles (user_id, role) VALUES (?1, ?2)",
            params![user_id, role],
        )
    })?;
    Ok(())
}

/**
 * \brief 列出用户角色。
 */
pub fn list_roles(conn: &Connection, user_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT role FROM user_roles WHERE user_id=?1 ORDER BY role ASC")?;
    let rows = stmt
        .query_map(params![user_id], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 登记一个访问 token 及其主体信息，供本地身份解析使用。
 */
pub fn insert_token(conn: &Connection, token: &str, principal: &Principal) -> Result<()> {
    let user_meta = serde_json::to_string(&principal.user_metadata)?;
    let app_meta = serde_json::to_string(&principal.app_metadata)?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO auth_tokens (token, user_id, email, user_metadata, app_metadata)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(token) DO UPDATE SET user_id=excluded.user_id, email=excluded.email,
             user_metadata=excluded.user_metadata, app_metadata=excluded.app_metadata",
            params![token, principal.id, principal.email, user_meta, app_meta],
        )
    })?;
    Ok(())
}

/**
 * \brief 按 token 查找主体。
 */
pub fn find_principal(conn: &Connection, token: &str) -> Result<Option<Principal>> {
    let row = conn
        .query_row(
            "SELECT user_id, email, user_metadata, app_metadata FROM auth_tokens WHERE token=?1",
            params![token],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;
    let Some((id, email, user_meta, app_meta)) = row else {
        return Ok(None);
    };
    Ok(Some(Principal {
        id,
        email,
        user_metadata: parse_object(&user_meta),
        app_metadata: parse_object(&app_meta),
    }))
}

/**
 * \brief 追加一条调用记录。
 */
pub fn insert_interaction(conn: &Connection, record: &InteractionRecord) -> Result<i64> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO ai_interactions
                 (user_id, note_id, action, prompt_chars, response_chars, succeeded, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.user_id,
                record.note_id,
                record.action,
                record.prompt_chars,
                record.response_chars,
                record.succeeded,
                record.created_at
            ],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 读取某用户的调用记录（按时间顺序）。
 */
pub fn list_interactions(conn: &Connection, user_id: &str) -> Result<Vec<InteractionRecord>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, note_id, action, prompt_chars, response_chars, succeeded, created_at
         FROM ai_interactions WHERE user_id=?1 ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![user_id], |row| {
            Ok(InteractionRecord {
                user_id: row.get(0)?,
                note_id: row.get(1)?,
                action: row.get(2)?,
                prompt_chars: row.get(3)?,
                response_chars: row.get(4)?,
                succeeded: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn parse_object(raw: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
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
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/**
 * \brief 基于 SQLite 的本地存储，同时实现内容存储与身份服务。
 */
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /**
     * \brief 打开数据库文件并执行迁移。
     */
    pub fn open(path: &str) -> Result<Self> {
        let conn = open_db(path)?;
        migrate(&conn).context("apply migrations failed")?;
        Ok(Self::from_connection(conn))
    }

    /**
     * \brief 内存数据库，主要用于测试。
     */
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /**
     * \brief 在持有连接锁的情况下执行同步操作。
     */
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))?;
        f(&conn)
    }
}

#[async_trait]
impl ContentStore for SqliteStore {
    async fn load_ai_config(&self) -> Result<Option<AiConfigRecord>> {
        let value = self.with_conn(|conn| get_section(conn, AI_CONFIG_SECTION))?;
        match value {
            Some(v) => Ok(Some(
                serde_json::from_value(v).context("ai_config row has unexpected shape")?,
            )),
            None => Ok(None),
        }
    }

    async fn save_ai_config(&self, record: &AiConfigRecord) -> Result<()> {
        let value = serde_json::to_value(record)?;
        self.with_conn(|conn| put_section(conn, AI_CONFIG_SECTION, &value))
    }

    async fn record_interaction(&self, record: &InteractionRecord) -> Result<()> {
        self.with_conn(|conn| insert_interaction(conn, record).map(|_| ()))
    }
}

#[async_trait]
impl IdentityProvider for SqliteStore {
    async fn resolve_principal(&self, token: &str) -> Result<Option<Principal>> {
        self.with_conn(|conn| find_principal(conn, token))
    }

    async fn user_roles(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| list_roles(conn, user_id))
    }
}
