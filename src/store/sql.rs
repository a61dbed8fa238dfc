//! SQLite store adapter built on `sqlx`.
//!
//! Identifiers are stored as text, timestamps as unix nanoseconds, and JSON payloads and vectors as
//! serialized text. The "one current embedding per target and model" rule is enforced by a partial
//! unique index so concurrent writers cannot both succeed.

use super::{
    ArtifactStore, ChunkStore, DocumentStore, EmbeddingStore, MonotonicClock, PipelineErrorStore,
    Store, merge_payload, rank_scored_chunks,
    similarity::cosine_similarity,
    types::*,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::HashSet;
use std::str::FromStr;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        source_path TEXT NOT NULL,
        content_hash TEXT NOT NULL UNIQUE,
        status TEXT NOT NULL,
        manufacturer TEXT,
        document_type TEXT,
        version TEXT,
        classified_at INTEGER,
        searchable INTEGER NOT NULL DEFAULT 0,
        indexed_at INTEGER,
        metadata TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL REFERENCES documents(id),
        idx INTEGER NOT NULL,
        page_start INTEGER NOT NULL,
        page_end INTEGER NOT NULL,
        raw_text TEXT NOT NULL,
        cleaned_text TEXT NOT NULL,
        chunk_type TEXT NOT NULL,
        chunk_hash TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE (document_id, idx)
    )",
    "CREATE TABLE IF NOT EXISTS embeddings (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        target_kind TEXT NOT NULL,
        target_id TEXT NOT NULL,
        model TEXT NOT NULL,
        vector TEXT NOT NULL,
        retired INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS embeddings_current
        ON embeddings (target_kind, target_id, model) WHERE retired = 0",
    "CREATE INDEX IF NOT EXISTS embeddings_document ON embeddings (document_id, model)",
    "CREATE TABLE IF NOT EXISTS artifacts (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL REFERENCES documents(id),
        kind TEXT NOT NULL,
        page INTEGER,
        chunk_id TEXT,
        context TEXT,
        method TEXT NOT NULL,
        confidence REAL NOT NULL,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS artifacts_document_kind ON artifacts (document_id, kind)",
    "CREATE TABLE IF NOT EXISTS pipeline_errors (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        stage TEXT NOT NULL,
        kind TEXT NOT NULL,
        message TEXT NOT NULL,
        quality_gate INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS pipeline_errors_document ON pipeline_errors (document_id)",
];

const DOCUMENT_COLUMNS: &str = "id, source_path, content_hash, status, manufacturer, document_type, \
     version, classified_at, searchable, indexed_at, metadata, created_at, updated_at";

const CHUNK_COLUMNS: &str = "id, document_id, idx, page_start, page_end, raw_text, cleaned_text, \
     chunk_type, chunk_hash, created_at";

const ARTIFACT_COLUMNS: &str =
    "id, document_id, kind, page, chunk_id, context, method, confidence, payload, created_at";

/// Store adapter backed by a SQLite database.
pub struct SqlStore {
    pool: SqlitePool,
    clock: MonotonicClock,
}

impl SqlStore {
    /// Connect to `url` (for example `sqlite://data/docpipe.db` or `sqlite::memory:`) and create
    /// the schema when missing.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let in_memory = url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            // A private in-memory database lives only as long as its single connection.
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        let store = Self {
            pool,
            clock: MonotonicClock::default(),
        };
        store.migrate().await?;
        debug!(url, "SQLite store ready");
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn fetch_document(&self, sql: &str, key: String) -> StoreResult<Option<Document>> {
        let row = sqlx::query(sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn fetch_artifact(&self, id: ArtifactId) -> StoreResult<Option<Artifact>> {
        let sql = format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(artifact_from_row).transpose()
    }

    async fn coverage(&self, sql: &str, binds: &[&str]) -> StoreResult<Coverage> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let row = query.fetch_one(&self.pool).await?;
        let count: i64 = row.try_get("count")?;
        let latest: Option<i64> = row.try_get("latest_at")?;
        Ok(Coverage {
            count: count.max(0) as u64,
            latest_at: latest.map(from_nanos).transpose()?,
        })
    }
}

fn to_nanos(timestamp: OffsetDateTime) -> i64 {
    i64::try_from(timestamp.unix_timestamp_nanos()).unwrap_or(i64::MAX)
}

fn from_nanos(nanos: i64) -> StoreResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
        .map_err(|err| StoreError::Corrupt(err.to_string()))
}

fn parse_uuid(value: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(value).map_err(|err| StoreError::Corrupt(format!("bad id '{value}': {err}")))
}

fn parse_enum<T>(value: &str) -> StoreResult<T>
where
    T: FromStr<Err = UnknownVariant>,
{
    value
        .parse()
        .map_err(|err: UnknownVariant| StoreError::Corrupt(err.to_string()))
}

fn to_u32(value: i64, column: &str) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} out of range: {value}")))
}

/// Map constraint violations to the store's own error variants.
fn write_error(err: sqlx::Error, conflict: impl FnOnce() -> StoreError) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => conflict(),
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            StoreError::not_found("referenced document", db.message())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(err.to_string())
        }
        _ => StoreError::Database(err),
    }
}

fn document_from_row(row: &SqliteRow) -> StoreResult<Document> {
    let status: String = row.try_get("status")?;
    let metadata: String = row.try_get("metadata")?;
    Ok(Document {
        id: parse_uuid(row.try_get("id")?)?,
        source_path: row.try_get("source_path")?,
        content_hash: row.try_get("content_hash")?,
        status: parse_enum(&status)?,
        manufacturer: row.try_get("manufacturer")?,
        document_type: row.try_get("document_type")?,
        version: row.try_get("version")?,
        classified_at: row
            .try_get::<Option<i64>, _>("classified_at")?
            .map(from_nanos)
            .transpose()?,
        searchable: row.try_get("searchable")?,
        indexed_at: row
            .try_get::<Option<i64>, _>("indexed_at")?
            .map(from_nanos)
            .transpose()?,
        metadata: serde_json::from_str(&metadata)?,
        created_at: from_nanos(row.try_get("created_at")?)?,
        updated_at: from_nanos(row.try_get("updated_at")?)?,
    })
}

fn chunk_from_row(row: &SqliteRow) -> StoreResult<Chunk> {
    let chunk_type: String = row.try_get("chunk_type")?;
    Ok(Chunk {
        id: parse_uuid(row.try_get("id")?)?,
        document_id: parse_uuid(row.try_get("document_id")?)?,
        index: to_u32(row.try_get("idx")?, "idx")?,
        page_start: to_u32(row.try_get("page_start")?, "page_start")?,
        page_end: to_u32(row.try_get("page_end")?, "page_end")?,
        raw_text: row.try_get("raw_text")?,
        cleaned_text: row.try_get("cleaned_text")?,
        chunk_type: parse_enum(&chunk_type)?,
        chunk_hash: row.try_get("chunk_hash")?,
        created_at: from_nanos(row.try_get("created_at")?)?,
    })
}

fn artifact_from_row(row: &SqliteRow) -> StoreResult<Artifact> {
    let kind: String = row.try_get("kind")?;
    let payload: String = row.try_get("payload")?;
    let chunk_id: Option<String> = row.try_get("chunk_id")?;
    Ok(Artifact {
        id: parse_uuid(row.try_get("id")?)?,
        document_id: parse_uuid(row.try_get("document_id")?)?,
        kind: parse_enum(&kind)?,
        page: row
            .try_get::<Option<i64>, _>("page")?
            .map(|page| to_u32(page, "page"))
            .transpose()?,
        chunk_id: chunk_id.as_deref().map(parse_uuid).transpose()?,
        context: row.try_get("context")?,
        method: row.try_get("method")?,
        confidence: row.try_get("confidence")?,
        payload: serde_json::from_str(&payload)?,
        created_at: from_nanos(row.try_get("created_at")?)?,
    })
}

fn error_from_row(row: &SqliteRow) -> StoreResult<PipelineErrorRecord> {
    let kind: String = row.try_get("kind")?;
    Ok(PipelineErrorRecord {
        id: parse_uuid(row.try_get("id")?)?,
        document_id: parse_uuid(row.try_get("document_id")?)?,
        stage: row.try_get("stage")?,
        kind: parse_enum(&kind)?,
        message: row.try_get("message")?,
        quality_gate: row.try_get("quality_gate")?,
        created_at: from_nanos(row.try_get("created_at")?)?,
    })
}

#[async_trait]
impl DocumentStore for SqlStore {
    async fn create_document(&self, document: NewDocument) -> StoreResult<Document> {
        let now = self.clock.now();
        let row = Document {
            id: Uuid::new_v4(),
            source_path: document.source_path,
            content_hash: document.content_hash,
            status: DocumentStatus::Uploaded,
            manufacturer: None,
            document_type: None,
            version: None,
            classified_at: None,
            searchable: false,
            indexed_at: None,
            metadata: document.metadata,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO documents (id, source_path, content_hash, status, searchable, metadata, \
             created_at, updated_at) VALUES (?, ?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(row.id.to_string())
        .bind(&row.source_path)
        .bind(&row.content_hash)
        .bind(row.status.as_str())
        .bind(serde_json::to_string(&row.metadata)?)
        .bind(to_nanos(now))
        .bind(to_nanos(now))
        .execute(&self.pool)
        .await
        .map_err(|err| {
            write_error(err, || {
                StoreError::Conflict(format!(
                    "document with hash {} already exists",
                    row.content_hash
                ))
            })
        })?;
        Ok(row)
    }

    async fn get_document(&self, id: DocumentId) -> StoreResult<Option<Document>> {
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?");
        self.fetch_document(&sql, id.to_string()).await
    }

    async fn get_document_by_hash(&self, content_hash: &str) -> StoreResult<Option<Document>> {
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE content_hash = ?");
        self.fetch_document(&sql, content_hash.to_string()).await
    }

    async fn update_document(
        &self,
        id: DocumentId,
        update: DocumentUpdate,
    ) -> StoreResult<Document> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("document", id))?;
        let mut document = document_from_row(&row)?;

        if let Some(status) = update.status {
            document.status = status;
        }
        if let Some(classification) = update.classification {
            document.manufacturer = classification.manufacturer;
            document.document_type = Some(classification.document_type);
            document.version = classification.version;
            document.classified_at = Some(now);
        }
        if let Some(searchable) = update.searchable {
            document.searchable = searchable;
            document.indexed_at = searchable.then_some(now);
        }
        document.updated_at = now;

        sqlx::query(
            "UPDATE documents SET status = ?, manufacturer = ?, document_type = ?, version = ?, \
             classified_at = ?, searchable = ?, indexed_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(document.status.as_str())
        .bind(&document.manufacturer)
        .bind(&document.document_type)
        .bind(&document.version)
        .bind(document.classified_at.map(to_nanos))
        .bind(document.searchable)
        .bind(document.indexed_at.map(to_nanos))
        .bind(to_nanos(now))
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(document)
    }

    async fn processing_queue(&self) -> StoreResult<Vec<Document>> {
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE status != ? ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(DocumentStatus::Completed.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(document_from_row).collect()
    }
}

#[async_trait]
impl ChunkStore for SqlStore {
    async fn create_chunk(&self, chunk: NewChunk) -> StoreResult<Chunk> {
        let row = Chunk::from_new(Uuid::new_v4(), chunk, self.clock.now());
        sqlx::query(
            "INSERT INTO chunks (id, document_id, idx, page_start, page_end, raw_text, \
             cleaned_text, chunk_type, chunk_hash, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(row.id.to_string())
        .bind(row.document_id.to_string())
        .bind(i64::from(row.index))
        .bind(i64::from(row.page_start))
        .bind(i64::from(row.page_end))
        .bind(&row.raw_text)
        .bind(&row.cleaned_text)
        .bind(row.chunk_type.as_str())
        .bind(&row.chunk_hash)
        .bind(to_nanos(row.created_at))
        .execute(&self.pool)
        .await
        .map_err(|err| {
            write_error(err, || {
                StoreError::Conflict(format!(
                    "chunk {} already exists for document {}",
                    row.index, row.document_id
                ))
            })
        })?;
        Ok(row)
    }

    async fn list_chunks(&self, document_id: DocumentId) -> StoreResult<Vec<Chunk>> {
        let sql = format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE document_id = ? ORDER BY idx");
        let rows = sqlx::query(&sql)
            .bind(document_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn chunk_coverage(&self, document_id: DocumentId) -> StoreResult<Coverage> {
        let id = document_id.to_string();
        self.coverage(
            "SELECT COUNT(*) AS count, MAX(created_at) AS latest_at FROM chunks WHERE document_id = ?",
            &[&id],
        )
        .await
    }

    async fn delete_chunks(&self, document_id: DocumentId) -> StoreResult<u64> {
        let id = document_id.to_string();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM embeddings WHERE target_kind = 'chunk' \
             AND target_id IN (SELECT id FROM chunks WHERE document_id = ?)",
        )
        .bind(&id)
        .execute(&mut *tx)
        .await?;
        let deleted = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted)
    }
}

#[async_trait]
impl EmbeddingStore for SqlStore {
    async fn create_embedding(&self, embedding: NewEmbedding) -> StoreResult<EmbeddingRecord> {
        let record = EmbeddingRecord {
            id: Uuid::new_v4(),
            document_id: embedding.document_id,
            target: embedding.target,
            model: embedding.model,
            vector: embedding.vector,
            retired: false,
            created_at: self.clock.now(),
        };
        sqlx::query(
            "INSERT INTO embeddings (id, document_id, target_kind, target_id, model, vector, \
             retired, created_at) VALUES (?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.document_id.to_string())
        .bind(record.target.kind().as_str())
        .bind(record.target.id().to_string())
        .bind(&record.model)
        .bind(serde_json::to_string(&record.vector)?)
        .bind(to_nanos(record.created_at))
        .execute(&self.pool)
        .await
        .map_err(|err| {
            write_error(err, || {
                StoreError::Conflict(format!(
                    "current {} embedding already exists for {} {}",
                    record.model,
                    record.target.kind(),
                    record.target.id()
                ))
            })
        })?;
        Ok(record)
    }

    async fn embedded_targets(
        &self,
        document_id: DocumentId,
        model: &str,
        kind: TargetKind,
    ) -> StoreResult<HashSet<Uuid>> {
        let rows = sqlx::query(
            "SELECT target_id FROM embeddings \
             WHERE document_id = ? AND model = ? AND target_kind = ? AND retired = 0",
        )
        .bind(document_id.to_string())
        .bind(model)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| parse_uuid(row.try_get("target_id")?))
            .collect()
    }

    async fn embedding_coverage(
        &self,
        document_id: DocumentId,
        model: &str,
        kind: TargetKind,
    ) -> StoreResult<Coverage> {
        let id = document_id.to_string();
        self.coverage(
            "SELECT COUNT(*) AS count, MAX(created_at) AS latest_at FROM embeddings \
             WHERE document_id = ? AND model = ? AND target_kind = ? AND retired = 0",
            &[&id, model, kind.as_str()],
        )
        .await
    }

    async fn search_embeddings(
        &self,
        query: &[f32],
        model: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> StoreResult<Vec<ScoredChunk>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT c.id, c.document_id, c.idx, c.page_start, c.chunk_type, c.cleaned_text, \
             e.vector FROM embeddings e \
             JOIN chunks c ON c.id = e.target_id \
             JOIN documents d ON d.id = c.document_id \
             WHERE e.retired = 0 AND e.target_kind = 'chunk' AND e.model = ",
        );
        builder.push_bind(model);
        if let Some(document_id) = filters.document_id {
            builder
                .push(" AND c.document_id = ")
                .push_bind(document_id.to_string());
        }
        if let Some(manufacturer) = &filters.manufacturer {
            builder
                .push(" AND lower(d.manufacturer) = ")
                .push_bind(manufacturer.trim().to_lowercase());
        }
        if let Some(types) = &filters.chunk_types {
            if types.is_empty() {
                return Ok(Vec::new());
            }
            builder.push(" AND c.chunk_type IN (");
            let mut separated = builder.separated(", ");
            for chunk_type in types {
                separated.push_bind(chunk_type.as_str());
            }
            separated.push_unseparated(")");
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let vector: String = row.try_get("vector")?;
            let vector: Vec<f32> = serde_json::from_str(&vector)?;
            let chunk_type: String = row.try_get("chunk_type")?;
            hits.push(ScoredChunk {
                chunk_id: parse_uuid(row.try_get("id")?)?,
                document_id: parse_uuid(row.try_get("document_id")?)?,
                index: to_u32(row.try_get("idx")?, "idx")?,
                page_start: to_u32(row.try_get("page_start")?, "page_start")?,
                chunk_type: parse_enum(&chunk_type)?,
                text: row.try_get("cleaned_text")?,
                score: cosine_similarity(query, &vector),
            });
        }
        Ok(rank_scored_chunks(hits, top_k))
    }

    async fn retire_embeddings(
        &self,
        document_id: DocumentId,
        model: &str,
        kind: TargetKind,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE embeddings SET retired = 1 \
             WHERE document_id = ? AND model = ? AND target_kind = ? AND retired = 0",
        )
        .bind(document_id.to_string())
        .bind(model)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ArtifactStore for SqlStore {
    async fn create_artifact(&self, artifact: NewArtifact) -> StoreResult<Artifact> {
        let row = Artifact::from_new(Uuid::new_v4(), artifact, self.clock.now());
        sqlx::query(
            "INSERT INTO artifacts (id, document_id, kind, page, chunk_id, context, method, \
             confidence, payload, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(row.id.to_string())
        .bind(row.document_id.to_string())
        .bind(row.kind.as_str())
        .bind(row.page.map(i64::from))
        .bind(row.chunk_id.map(|id| id.to_string()))
        .bind(&row.context)
        .bind(&row.method)
        .bind(row.confidence)
        .bind(serde_json::to_string(&row.payload)?)
        .bind(to_nanos(row.created_at))
        .execute(&self.pool)
        .await
        .map_err(|err| {
            write_error(err, || {
                StoreError::Conflict(format!("artifact {} already exists", row.id))
            })
        })?;
        Ok(row)
    }

    async fn list_artifacts(
        &self,
        document_id: DocumentId,
        kind: ArtifactKind,
    ) -> StoreResult<Vec<Artifact>> {
        let sql = format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE document_id = ? AND kind = ? \
             ORDER BY COALESCE(page, 4294967295), created_at"
        );
        let rows = sqlx::query(&sql)
            .bind(document_id.to_string())
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(artifact_from_row).collect()
    }

    async fn artifact_coverage(
        &self,
        document_id: DocumentId,
        kind: ArtifactKind,
    ) -> StoreResult<Coverage> {
        let id = document_id.to_string();
        self.coverage(
            "SELECT COUNT(*) AS count, MAX(created_at) AS latest_at FROM artifacts \
             WHERE document_id = ? AND kind = ?",
            &[&id, kind.as_str()],
        )
        .await
    }

    async fn patch_artifact(
        &self,
        id: ArtifactId,
        patch: serde_json::Value,
    ) -> StoreResult<Artifact> {
        let mut artifact = self
            .fetch_artifact(id)
            .await?
            .ok_or_else(|| StoreError::not_found("artifact", id))?;
        merge_payload(&mut artifact.payload, patch);
        sqlx::query("UPDATE artifacts SET payload = ? WHERE id = ?")
            .bind(serde_json::to_string(&artifact.payload)?)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(artifact)
    }

    async fn delete_artifacts(
        &self,
        document_id: DocumentId,
        kind: ArtifactKind,
    ) -> StoreResult<u64> {
        let id = document_id.to_string();
        let mut tx = self.pool.begin().await?;
        if kind == ArtifactKind::Image {
            sqlx::query(
                "DELETE FROM embeddings WHERE target_kind = 'image' \
                 AND target_id IN (SELECT id FROM artifacts WHERE document_id = ? AND kind = ?)",
            )
            .bind(&id)
            .bind(kind.as_str())
            .execute(&mut *tx)
            .await?;
        }
        let deleted = sqlx::query("DELETE FROM artifacts WHERE document_id = ? AND kind = ?")
            .bind(&id)
            .bind(kind.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted)
    }
}

#[async_trait]
impl PipelineErrorStore for SqlStore {
    async fn create_pipeline_error(
        &self,
        error: NewPipelineError,
    ) -> StoreResult<PipelineErrorRecord> {
        let record = PipelineErrorRecord {
            id: Uuid::new_v4(),
            document_id: error.document_id,
            stage: error.stage,
            kind: error.kind,
            message: error.message,
            quality_gate: error.quality_gate,
            created_at: self.clock.now(),
        };
        sqlx::query(
            "INSERT INTO pipeline_errors (id, document_id, stage, kind, message, quality_gate, \
             created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.document_id.to_string())
        .bind(&record.stage)
        .bind(record.kind.as_str())
        .bind(&record.message)
        .bind(record.quality_gate)
        .bind(to_nanos(record.created_at))
        .execute(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get_pipeline_errors(
        &self,
        document_id: DocumentId,
    ) -> StoreResult<Vec<PipelineErrorRecord>> {
        let rows = sqlx::query(
            "SELECT id, document_id, stage, kind, message, quality_gate, created_at \
             FROM pipeline_errors WHERE document_id = ? ORDER BY created_at ASC",
        )
        .bind(document_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(error_from_row).collect()
    }
}

#[async_trait]
impl Store for SqlStore {
    async fn document_counts(
        &self,
        document_id: DocumentId,
        model: &str,
    ) -> StoreResult<DocumentCounts> {
        let id = document_id.to_string();
        let row = sqlx::query(
            "SELECT \
             (SELECT COUNT(*) FROM chunks WHERE document_id = ?) AS chunks, \
             (SELECT COUNT(*) FROM embeddings WHERE document_id = ? AND model = ? \
                AND target_kind = 'chunk' AND retired = 0) AS embeddings, \
             (SELECT COUNT(*) FROM artifacts WHERE document_id = ? AND kind = 'link') AS links, \
             (SELECT COUNT(*) FROM artifacts WHERE document_id = ? AND kind = 'video') AS videos, \
             (SELECT COUNT(*) FROM artifacts WHERE document_id = ? AND kind = 'table') AS tables, \
             (SELECT COUNT(*) FROM artifacts WHERE document_id = ? AND kind = 'image') AS images",
        )
        .bind(&id)
        .bind(&id)
        .bind(model)
        .bind(&id)
        .bind(&id)
        .bind(&id)
        .bind(&id)
        .fetch_one(&self.pool)
        .await?;

        let count = |column: &str| -> StoreResult<u64> {
            let value: i64 = row.try_get(column)?;
            Ok(value.max(0) as u64)
        };
        Ok(DocumentCounts {
            chunks: count("chunks")?,
            embeddings: count("embeddings")?,
            links: count("links")?,
            videos: count("videos")?,
            tables: count("tables")?,
            images: count("images")?,
        })
    }
}
