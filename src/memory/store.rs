//! Hybrid BM25-ish keyword + optional-cosine vector memory, with temporal
//! decay and a `consolidate` step that writes a turn summary. Algorithm
//! (chunking, keyword scoring, cosine, decay curve, score threshold) is a
//! direct port of `original_source/clawlite/core/vector_memory.py`; the
//! SQLite access shape (per-call connection, WAL pragma) is grounded on the
//! teacher's `agent/memory/memory_db.rs`.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::sha256_hex;

const DEFAULT_CHUNK_WORDS: usize = 400;
const DEFAULT_CHUNK_OVERLAP: usize = 80;
const DEFAULT_MAX_RESULTS: usize = 6;
const DEFAULT_MIN_SCORE: f64 = 0.25;
const DEFAULT_VECTOR_WEIGHT: f64 = 0.7;
const DEFAULT_KEYWORD_WEIGHT: f64 = 0.3;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub text: String,
    pub source: String,
    pub score: f64,
    pub chunk_id: String,
}

/// A consolidated user/assistant pair, written to memory after each reply.
pub struct ConsolidatedTurn<'a> {
    pub session_id: &'a str,
    pub user_text: &'a str,
    pub assistant_text: &'a str,
}

/// Computes embeddings for one or more texts. A real deployment wires this
/// to the OpenAI embeddings endpoint; tests and offline-only setups use a
/// no-op implementation, which degrades search to keyword-only per
/// `spec.md` §4.7.
pub trait EmbeddingBackend: Send + Sync {
    fn embed(&self, texts: &[String]) -> Vec<Vec<f32>>;
}

pub struct NoEmbeddings;

impl EmbeddingBackend for NoEmbeddings {
    fn embed(&self, texts: &[String]) -> Vec<Vec<f32>> {
        vec![Vec::new(); texts.len()]
    }
}

pub struct MemoryStore {
    db_path: PathBuf,
    embeddings: Box<dyn EmbeddingBackend>,
    max_results: usize,
    min_score: f64,
    vector_weight: f64,
    keyword_weight: f64,
}

impl MemoryStore {
    pub fn new(state_root: impl AsRef<Path>) -> Result<Self, MemoryError> {
        Self::with_embeddings(state_root, Box::new(NoEmbeddings))
    }

    pub fn with_embeddings(state_root: impl AsRef<Path>, embeddings: Box<dyn EmbeddingBackend>) -> Result<Self, MemoryError> {
        let dir = state_root.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let store = MemoryStore {
            db_path: dir.join("memory.sqlite3"),
            embeddings,
            max_results: DEFAULT_MAX_RESULTS,
            min_score: DEFAULT_MIN_SCORE,
            vector_weight: DEFAULT_VECTOR_WEIGHT,
            keyword_weight: DEFAULT_KEYWORD_WEIGHT,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, MemoryError> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=3000;")?;
        Ok(conn)
    }

    fn ensure_schema(&self) -> Result<(), MemoryError> {
        let conn = self.connect()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                text TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT '',
                embedding TEXT NOT NULL DEFAULT '[]',
                created_at REAL NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            )",
            [],
        )?;
        conn.execute("CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source)", [])?;
        Ok(())
    }

    fn chunk_text(text: &str) -> Vec<String> {
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.len() <= DEFAULT_CHUNK_WORDS {
            return vec![text.to_string()];
        }
        let mut chunks = Vec::new();
        let mut start = 0;
        while start < words.len() {
            let end = (start + DEFAULT_CHUNK_WORDS).min(words.len());
            chunks.push(words[start..end].join(" "));
            start += DEFAULT_CHUNK_WORDS - DEFAULT_CHUNK_OVERLAP;
            if start >= words.len() {
                break;
            }
        }
        chunks
    }

    /// Stores `text` as one or more chunks under `source`, embedding each
    /// chunk if a real backend is configured. Returns the number of chunks
    /// written.
    pub fn store(&self, text: &str, source: &str, metadata: serde_json::Value) -> Result<usize, MemoryError> {
        let chunks = Self::chunk_text(text);
        if chunks.is_empty() {
            return Ok(0);
        }
        let embeddings = self.embeddings.embed(&chunks);
        let now = now_secs();
        let conn = self.connect()?;
        let mut stored = 0;
        for (chunk_text, embedding) in chunks.iter().zip(embeddings.iter()) {
            let preview: String = chunk_text.chars().take(200).collect();
            let chunk_id = sha256_hex(format!("{source}:{preview}").as_bytes())[..16].to_string();
            conn.execute(
                "INSERT OR REPLACE INTO chunks (id, text, source, embedding, created_at, metadata) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![chunk_id, chunk_text, source, serde_json::to_string(embedding)?, now, metadata.to_string()],
            )?;
            stored += 1;
        }
        Ok(stored)
    }

    /// Writes a compact summary of a conversational turn to memory, tagged
    /// with `source="turn:<session_id>"`.
    pub fn consolidate(&self, turn: ConsolidatedTurn<'_>) -> Result<(), MemoryError> {
        let summary = format!("Usuário: {}\nAssistente: {}", truncate(turn.user_text, 500), truncate(turn.assistant_text, 500));
        self.store(&summary, &format!("turn:{}", turn.session_id), serde_json::json!({}))?;
        Ok(())
    }

    fn keyword_score(query: &str, text: &str) -> f64 {
        let query_words: std::collections::HashSet<String> = query.split_whitespace().filter(|w| w.len() > 2).map(|w| w.to_lowercase()).collect();
        if query_words.is_empty() {
            return 0.0;
        }
        let text_lower = text.to_lowercase();
        let hits = query_words.iter().filter(|w| text_lower.contains(w.as_str())).count();
        hits as f64 / query_words.len() as f64
    }

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
        if a.is_empty() || a.len() != b.len() {
            return 0.0;
        }
        let dot: f64 = a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum();
        let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
        let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a * norm_b)
    }

    /// Hybrid search: `vector_weight * cosine + keyword_weight * bm25`,
    /// scaled by `0.9 + 0.1 * (1 / (1 + age_days/30))`, filtered by
    /// `min_score`, returning the top `max_results` by score descending.
    pub fn search(&self, query: &str) -> Result<Vec<SearchResult>, MemoryError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT id, text, source, embedding, created_at FROM chunks")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?, row.get::<_, String>(3)?, row.get::<_, f64>(4)?))
        })?;

        let query_embedding = self.embeddings.embed(&[query.to_string()]).into_iter().next().unwrap_or_default();
        let has_vector = !query_embedding.is_empty();
        let now = now_secs();

        let mut scored: Vec<(f64, SearchResult)> = Vec::new();
        for row in rows {
            let (chunk_id, text, source, embedding_json, created_at) = row?;
            let kw_score = Self::keyword_score(query, &text);

            let mut vec_score = 0.0;
            if has_vector {
                if let Ok(stored_embedding) = serde_json::from_str::<Vec<f32>>(&embedding_json) {
                    if !stored_embedding.is_empty() {
                        vec_score = Self::cosine_similarity(&query_embedding, &stored_embedding);
                    }
                }
            }

            let mut final_score = if has_vector { self.vector_weight * vec_score + self.keyword_weight * kw_score } else { kw_score };

            let age_days = (now - created_at).max(0.0) / 86400.0;
            let decay = 1.0 / (1.0 + age_days / 30.0);
            final_score *= 0.9 + 0.1 * decay;

            if final_score >= self.min_score {
                scored.push((final_score, SearchResult { text, source, score: (final_score * 10_000.0).round() / 10_000.0, chunk_id }));
            }
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.max_results);
        Ok(scored.into_iter().map(|(_, r)| r).collect())
    }

    pub fn delete_by_source(&self, source: &str) -> Result<usize, MemoryError> {
        let conn = self.connect()?;
        Ok(conn.execute("DELETE FROM chunks WHERE source = ?1", params![source])?)
    }
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn keyword_only_search_finds_matching_chunk() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new(dir.path()).unwrap();
        store.store("o servidor caiu durante o deploy de ontem", "manual", serde_json::json!({})).unwrap();
        store.store("receita de bolo de chocolate", "manual", serde_json::json!({})).unwrap();

        let results = store.search("deploy servidor").unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].text.contains("deploy"));
    }

    #[test]
    fn below_threshold_results_are_filtered() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new(dir.path()).unwrap();
        store.store("texto completamente irrelevante para a consulta", "manual", serde_json::json!({})).unwrap();

        let results = store.search("batata frita").unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn consolidate_writes_a_turn_summary() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new(dir.path()).unwrap();
        store
            .consolidate(ConsolidatedTurn { session_id: "s1", user_text: "qual o clima em lisboa hoje", assistant_text: "está ensolarado em lisboa" })
            .unwrap();

        let results = store.search("clima lisboa").unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, "turn:s1");
    }

    #[test]
    fn delete_by_source_removes_matching_chunks() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new(dir.path()).unwrap();
        store.store("nota temporaria sobre o projeto x", "scratch", serde_json::json!({})).unwrap();
        assert_eq!(store.delete_by_source("scratch").unwrap(), 1);
        assert!(store.search("projeto x").unwrap().is_empty());
    }

    struct FakeEmbeddings;
    impl EmbeddingBackend for FakeEmbeddings {
        fn embed(&self, texts: &[String]) -> Vec<Vec<f32>> {
            texts.iter().map(|t| if t.contains("gato") { vec![1.0, 0.0] } else { vec![0.0, 1.0] }).collect()
        }
    }

    #[test]
    fn vector_score_contributes_when_backend_is_configured() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::with_embeddings(dir.path(), Box::new(FakeEmbeddings)).unwrap();
        store.store("o gato dorme no sofa", "manual", serde_json::json!({})).unwrap();
        store.store("o carro esta na garagem", "manual", serde_json::json!({})).unwrap();

        let results = store.search("gato").unwrap();
        assert!(!results.is_empty());
        assert!(results[0].text.contains("gato"));
    }
}
