use crate::error::{Error, Result};
use crate::record::{RequestRecord, ResponseRecord};
use crate::wire::WireRequest;
use async_trait::async_trait;

/// Persistence for captured requests.
#[async_trait]
pub trait RequestStore {
    /// Persists the record and returns its opaque id.
    async fn save(&self, record: &RequestRecord) -> Result<String>;
    /// Retrieves one record. Unknown or malformed ids are `NotFound`.
    async fn get(&self, id: &str) -> Result<RequestRecord>;
    /// Retrieves the newest `limit` records, newest first.
    async fn list(&self, limit: i64) -> Result<Vec<RequestRecord>>;

    /// Rebuilds a live request that round-trips the capture.
    async fn get_encoded(&self, id: &str) -> Result<WireRequest>
    where
        Self: Sync,
    {
        Ok(self.get(id).await?.to_wire())
    }
}

/// Persistence for captured responses.
#[async_trait]
pub trait ResponseStore {
    async fn save(&self, request_id: &str, record: &ResponseRecord) -> Result<String>;
    async fn get(&self, id: &str) -> Result<ResponseRecord>;
    /// The response captured for a given request id.
    async fn get_by_request(&self, request_id: &str) -> Result<ResponseRecord>;
    async fn list(&self, limit: i64) -> Result<Vec<ResponseRecord>>;
}

/// Document store over libsql: one JSON document per capture row, integer
/// row ids exposed as the opaque record ids so listings order by insertion.
pub struct LibSqlStore {
    conn: libsql::Connection,
}

impl LibSqlStore {
    pub async fn connect(db_url: &str) -> Result<Self> {
        let db = libsql::Builder::new_local(db_url)
            .build()
            .await
            .map_err(Error::store)?;
        let conn = db.connect().map_err(Error::store)?;
        conn.query("PRAGMA journal_mode = WAL", ())
            .await
            .map_err(Error::store)?;
        conn.query("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(Error::store)?;
        conn.query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(Error::store)?;
        Ok(Self { conn })
    }

    pub async fn init_tables(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS requests (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    document TEXT NOT NULL
                )",
                (),
            )
            .await
            .map_err(Error::store)?;
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS responses (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    request_id INTEGER NOT NULL REFERENCES requests (id),
                    document TEXT NOT NULL
                )",
                (),
            )
            .await
            .map_err(Error::store)?;
        self.conn
            .execute(
                "CREATE INDEX IF NOT EXISTS responses_request_id_idx ON responses (request_id)",
                (),
            )
            .await
            .map_err(Error::store)?;
        Ok(())
    }
}

fn parse_id(id: &str) -> Result<i64> {
    id.parse().map_err(|_| Error::not_found(id))
}

#[async_trait]
impl RequestStore for LibSqlStore {
    async fn save(&self, record: &RequestRecord) -> Result<String> {
        let document = serde_json::to_string(record).map_err(Error::store)?;
        self.conn
            .execute(
                "INSERT INTO requests (document) VALUES (?1)",
                libsql::params![document],
            )
            .await
            .map_err(Error::store)?;
        Ok(self.conn.last_insert_rowid().to_string())
    }

    async fn get(&self, id: &str) -> Result<RequestRecord> {
        let row_id = parse_id(id)?;
        let mut rows = self
            .conn
            .query(
                "SELECT document FROM requests WHERE id = ?1",
                libsql::params![row_id],
            )
            .await
            .map_err(Error::store)?;
        let row = rows
            .next()
            .await
            .map_err(Error::store)?
            .ok_or_else(|| Error::not_found(id))?;
        let document: String = row.get(0).map_err(Error::store)?;
        let mut record: RequestRecord = serde_json::from_str(&document).map_err(Error::store)?;
        record.id = Some(id.to_string());
        Ok(record)
    }

    async fn list(&self, limit: i64) -> Result<Vec<RequestRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, document FROM requests ORDER BY id DESC LIMIT ?1",
                libsql::params![limit],
            )
            .await
            .map_err(Error::store)?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(Error::store)? {
            let id: i64 = row.get(0).map_err(Error::store)?;
            let document: String = row.get(1).map_err(Error::store)?;
            let mut record: RequestRecord =
                serde_json::from_str(&document).map_err(Error::store)?;
            record.id = Some(id.to_string());
            records.push(record);
        }
        Ok(records)
    }
}

#[async_trait]
impl ResponseStore for LibSqlStore {
    async fn save(&self, request_id: &str, record: &ResponseRecord) -> Result<String> {
        let request_row_id = parse_id(request_id)?;
        let document = serde_json::to_string(record).map_err(Error::store)?;
        self.conn
            .execute(
                "INSERT INTO responses (request_id, document) VALUES (?1, ?2)",
                libsql::params![request_row_id, document],
            )
            .await
            .map_err(Error::store)?;
        Ok(self.conn.last_insert_rowid().to_string())
    }

    async fn get(&self, id: &str) -> Result<ResponseRecord> {
        let row_id = parse_id(id)?;
        let mut rows = self
            .conn
            .query(
                "SELECT document FROM responses WHERE id = ?1",
                libsql::params![row_id],
            )
            .await
            .map_err(Error::store)?;
        let row = rows
            .next()
            .await
            .map_err(Error::store)?
            .ok_or_else(|| Error::not_found(id))?;
        let document: String = row.get(0).map_err(Error::store)?;
        let mut record: ResponseRecord = serde_json::from_str(&document).map_err(Error::store)?;
        record.id = Some(id.to_string());
        Ok(record)
    }

    async fn get_by_request(&self, request_id: &str) -> Result<ResponseRecord> {
        let request_row_id = parse_id(request_id)?;
        let mut rows = self
            .conn
            .query(
                "SELECT id, document FROM responses WHERE request_id = ?1 ORDER BY id DESC LIMIT 1",
                libsql::params![request_row_id],
            )
            .await
            .map_err(Error::store)?;
        let row = rows
            .next()
            .await
            .map_err(Error::store)?
            .ok_or_else(|| Error::not_found(request_id))?;
        let id: i64 = row.get(0).map_err(Error::store)?;
        let document: String = row.get(1).map_err(Error::store)?;
        let mut record: ResponseRecord = serde_json::from_str(&document).map_err(Error::store)?;
        record.id = Some(id.to_string());
        Ok(record)
    }

    async fn list(&self, limit: i64) -> Result<Vec<ResponseRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, document FROM responses ORDER BY id DESC LIMIT ?1",
                libsql::params![limit],
            )
            .await
            .map_err(Error::store)?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(Error::store)? {
            let id: i64 = row.get(0).map_err(Error::store)?;
            let document: String = row.get(1).map_err(Error::store)?;
            let mut record: ResponseRecord =
                serde_json::from_str(&document).map_err(Error::store)?;
            record.id = Some(id.to_string());
            records.push(record);
        }
        Ok(records)
    }
}
