use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection};
use tracing::debug;

use stockflow_core::error::{Result, StockflowError};
use stockflow_core::traits::{ReportStore, VectorStore};
use stockflow_core::types::{Document, DocumentFilter, ReportRecord, SourceType};

use crate::scorer::cosine_similarity;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        content TEXT NOT NULL,
        source_type TEXT NOT NULL,
        published_at TEXT NOT NULL,
        embedding BLOB NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_documents_source
        ON documents(source_type, published_at);

    CREATE TABLE IF NOT EXISTS reports (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        created_at TEXT NOT NULL,
        sections TEXT NOT NULL
    );";

/// SQLite-backed document corpus and report archive.
///
/// Documents persist beyond a single run; similarity search loads the
/// filtered candidate set and ranks by cosine similarity in process.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StockflowError::Database(format!("failed to create db directory: {}", e))
            })?;
        }

        let conn =
            Connection::open(path).map_err(|e| StockflowError::Database(e.to_string()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StockflowError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StockflowError::Database(e.to_string()))?;

        debug!(path = %path.display(), "sqlite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| StockflowError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StockflowError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn source_type_str(st: SourceType) -> &'static str {
    match st {
        SourceType::RegulatoryFiling => "regulatory_filing",
        SourceType::EarningsCall => "earnings_call",
        SourceType::AnalystReport => "analyst_report",
        SourceType::CompanyPress => "company_press",
        SourceType::News => "news",
        SourceType::Social => "social",
    }
}

fn parse_source_type(s: &str) -> SourceType {
    match s {
        "regulatory_filing" => SourceType::RegulatoryFiling,
        "earnings_call" => SourceType::EarningsCall,
        "analyst_report" => SourceType::AnalystReport,
        "company_press" => SourceType::CompanyPress,
        "social" => SourceType::Social,
        _ => SourceType::News,
    }
}

fn embedding_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn parse_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl VectorStore for SqliteStore {
    fn upsert(&self, doc: &Document) -> BoxFuture<'_, Result<()>> {
        let doc = doc.clone();
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| StockflowError::Database(e.to_string()))?;
            conn.execute(
                "INSERT OR REPLACE INTO documents (id, content, source_type, published_at, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    doc.id,
                    doc.content,
                    source_type_str(doc.source_type),
                    doc.published_at.to_rfc3339(),
                    embedding_blob(&doc.embedding),
                ],
            )
            .map_err(|e| StockflowError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn query(
        &self,
        embedding: &[f32],
        filter: &DocumentFilter,
        top_k: usize,
    ) -> BoxFuture<'_, Result<Vec<Document>>> {
        let query_vec = embedding.to_vec();
        let filter = filter.clone();
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| StockflowError::Database(e.to_string()))?;

            let mut stmt = conn
                .prepare(
                    "SELECT id, content, source_type, published_at, embedding FROM documents",
                )
                .map_err(|e| StockflowError::Database(e.to_string()))?;

            let rows = stmt
                .query_map([], |row| {
                    let id: String = row.get(0)?;
                    let content: String = row.get(1)?;
                    let st: String = row.get(2)?;
                    let ts: String = row.get(3)?;
                    let blob: Vec<u8> = row.get(4)?;
                    Ok((id, content, st, ts, blob))
                })
                .map_err(|e| StockflowError::Database(e.to_string()))?;

            let mut scored: Vec<(f32, Document)> = Vec::new();
            for row in rows {
                let (id, content, st, ts, blob) =
                    row.map_err(|e| StockflowError::Database(e.to_string()))?;
                let doc = Document {
                    id,
                    content,
                    embedding: parse_embedding(&blob),
                    source_type: parse_source_type(&st),
                    published_at: parse_timestamp(&ts),
                };

                if !filter.source_types.is_empty()
                    && !filter.source_types.contains(&doc.source_type)
                {
                    continue;
                }
                if let Some(after) = filter.published_after {
                    if doc.published_at < after {
                        continue;
                    }
                }

                let sim = cosine_similarity(&query_vec, &doc.embedding);
                scored.push((sim, doc));
            }

            scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(top_k);

            Ok(scored.into_iter().map(|(_, d)| d).collect())
        })
    }
}

impl ReportStore for SqliteStore {
    fn save(&self, report: &ReportRecord) -> BoxFuture<'_, Result<()>> {
        let report = report.clone();
        Box::pin(async move {
            let sections = serde_json::to_string(&report.sections)?;
            let conn = self
                .conn
                .lock()
                .map_err(|e| StockflowError::Database(e.to_string()))?;
            conn.execute(
                "INSERT OR REPLACE INTO reports (id, title, created_at, sections)
                 VALUES (?1, ?2, ?3, ?4)",
                params![report.id, report.title, report.created_at.to_rfc3339(), sections],
            )
            .map_err(|e| StockflowError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<ReportRecord>>> {
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| StockflowError::Database(e.to_string()))?;
            let mut stmt = conn
                .prepare("SELECT id, title, created_at, sections FROM reports ORDER BY created_at DESC")
                .map_err(|e| StockflowError::Database(e.to_string()))?;

            let rows = stmt
                .query_map([], |row| {
                    let id: String = row.get(0)?;
                    let title: String = row.get(1)?;
                    let ts: String = row.get(2)?;
                    let sections: String = row.get(3)?;
                    Ok((id, title, ts, sections))
                })
                .map_err(|e| StockflowError::Database(e.to_string()))?;

            let mut reports = Vec::new();
            for row in rows {
                let (id, title, ts, sections) =
                    row.map_err(|e| StockflowError::Database(e.to_string()))?;
                reports.push(ReportRecord {
                    id,
                    title,
                    created_at: parse_timestamp(&ts),
                    sections: serde_json::from_str(&sections).unwrap_or_default(),
                });
            }
            Ok(reports)
        })
    }

    fn delete(&self, id: &str) -> BoxFuture<'_, Result<()>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| StockflowError::Database(e.to_string()))?;
            conn.execute("DELETE FROM reports WHERE id = ?1", params![id])
                .map_err(|e| StockflowError::Database(e.to_string()))?;
            Ok(())
        })
    }
}
