//! File-backed knowledge store.
//!
//! Entities are appended as JSON lines per repository under the data
//! directory's `knowledge/` sibling. Search is a naive token-overlap
//! score; the real vector indices are an external collaborator and stay
//! opaque to the core.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

use crate::domain::error::CoreError;
use crate::domain::ports::{KnowledgeEntity, KnowledgeStore};

pub struct FileKnowledgeStore {
    dir: PathBuf,
}

impl FileKnowledgeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_for(&self, repository_path: &str) -> PathBuf {
        let mut slug: String = repository_path
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        if slug.is_empty() {
            slug.push('_');
        }
        self.dir.join(format!("{slug}.jsonl"))
    }
}

#[async_trait]
impl KnowledgeStore for FileKnowledgeStore {
    async fn store_entity(&self, entity: KnowledgeEntity) -> Result<(), CoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CoreError::Store(format!("knowledge dir: {e}")))?;

        let line = serde_json::to_string(&entity)
            .map_err(|e| CoreError::Store(format!("knowledge entity: {e}")))?;
        let path = self.file_for(&entity.repository_path);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| CoreError::Store(format!("{}: {e}", path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;
        Ok(())
    }

    async fn semantic_search(
        &self,
        repository_path: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeEntity>, CoreError> {
        let path = self.file_for(repository_path);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CoreError::Store(format!("{}: {e}", path.display()))),
        };

        let query_tokens: HashSet<String> = tokenize(query);
        let mut scored: Vec<(usize, KnowledgeEntity)> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<KnowledgeEntity>(line).ok())
            .map(|entity| {
                let tokens = tokenize(&format!("{} {}", entity.title, entity.content));
                let overlap = tokens.intersection(&query_tokens).count();
                (overlap, entity)
            })
            .filter(|(score, _)| *score > 0 || query_tokens.is_empty())
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, entity)| entity)
            .collect())
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| token.len() > 2)
        .map(ToString::to_string)
        .collect()
}

/// In-memory store for tests and for running without a data directory.
#[derive(Default)]
pub struct MemoryKnowledgeStore {
    entities: tokio::sync::Mutex<Vec<KnowledgeEntity>>,
}

impl MemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entities(&self) -> Vec<KnowledgeEntity> {
        self.entities.lock().await.clone()
    }
}

#[async_trait]
impl KnowledgeStore for MemoryKnowledgeStore {
    async fn store_entity(&self, entity: KnowledgeEntity) -> Result<(), CoreError> {
        self.entities.lock().await.push(entity);
        Ok(())
    }

    async fn semantic_search(
        &self,
        repository_path: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeEntity>, CoreError> {
        let query_tokens = tokenize(query);
        Ok(self
            .entities
            .lock()
            .await
            .iter()
            .filter(|e| e.repository_path == repository_path)
            .filter(|e| {
                query_tokens.is_empty()
                    || tokenize(&format!("{} {}", e.title, e.content))
                        .intersection(&query_tokens)
                        .count()
                        > 0
            })
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKnowledgeStore::new(dir.path());

        store
            .store_entity(KnowledgeEntity::new(
                "/r",
                "orchestration_summary",
                "OAuth rollout",
                "Completed 4 objectives across backend and frontend",
            ))
            .await
            .unwrap();
        store
            .store_entity(KnowledgeEntity::new(
                "/r",
                "orchestration_summary",
                "Unrelated",
                "Nothing in common",
            ))
            .await
            .unwrap();

        let hits = store.semantic_search("/r", "oauth backend", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "OAuth rollout");

        // Other repositories stay isolated
        let other = store.semantic_search("/other", "oauth", 10).await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_search() {
        let store = MemoryKnowledgeStore::new();
        store
            .store_entity(KnowledgeEntity::new("/r", "note", "lease expiry", "jobs reset"))
            .await
            .unwrap();
        let hits = store.semantic_search("/r", "lease", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
    }
}
