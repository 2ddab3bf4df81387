//! Long-term memory: vector-embedded summaries with lock/visibility flags.
//!
//! Retrieval is cosine similarity over the owner's memories. Hidden memories
//! never take part in retrieval. Locked memories are never removed by
//! [`MemoryStore::purge_scope`] or [`MemoryStore::delete_batch`], whatever
//! their visibility.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Cosine similarity, 0.0 for mismatched or zero vectors.
pub fn cosine_sim(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Normal,
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerScope {
    pub persona_id: String,
    pub personality_id: String,
}

impl OwnerScope {
    pub fn new(persona_id: impl Into<String>, personality_id: impl Into<String>) -> Self {
        Self {
            persona_id: persona_id.into(),
            personality_id: personality_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: Uuid,
    pub persona_id: String,
    pub personality_id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub visibility: Visibility,
    /// Long summaries are split into chunks sharing a group id.
    #[serde(default)]
    pub chunk_group_id: Option<Uuid>,
    #[serde(default)]
    pub chunk_index: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Memory {
    pub fn new(owner: &OwnerScope, content: impl Into<String>, embedding: Vec<f32>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            persona_id: owner.persona_id.clone(),
            personality_id: owner.personality_id.clone(),
            content: content.into(),
            embedding,
            locked: false,
            visibility: Visibility::Normal,
            chunk_group_id: None,
            chunk_index: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_chunk(mut self, group: Uuid, index: u32) -> Self {
        self.chunk_group_id = Some(group);
        self.chunk_index = index;
        self
    }

    pub fn owned_by(&self, owner: &OwnerScope) -> bool {
        self.persona_id == owner.persona_id && self.personality_id == owner.personality_id
    }

    pub fn is_hidden(&self) -> bool {
        self.visibility == Visibility::Hidden
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub score: f32,
}

/// Outcome of a bulk removal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub deleted: usize,
    pub skipped_locked: usize,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Write path of the summarizer.
    async fn insert(&self, memory: Memory) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Memory>>;

    /// Memories of `owner` scoring at least `score_threshold` against `query`,
    /// best first, at most `limit`, at most one per chunk group. Hidden
    /// memories are excluded.
    async fn retrieve(
        &self,
        owner: &OwnerScope,
        query: &[f32],
        limit: usize,
        score_threshold: f32,
    ) -> Result<Vec<ScoredMemory>>;

    /// Every memory of `owner`, oldest first. Hidden ones only on request.
    async fn list(&self, owner: &OwnerScope, include_hidden: bool) -> Result<Vec<Memory>>;

    async fn set_locked(&self, id: Uuid, locked: bool) -> Result<()>;

    async fn set_visibility(&self, id: Uuid, visibility: Visibility) -> Result<()>;

    /// Replace text and embedding together.
    async fn update_content(&self, id: Uuid, content: String, embedding: Vec<f32>) -> Result<()>;

    /// Delete every unlocked memory of `owner`.
    async fn purge_scope(&self, owner: &OwnerScope) -> Result<PurgeReport>;

    /// Delete the given memories, skipping locked ones.
    async fn delete_batch(&self, ids: &[Uuid]) -> Result<PurgeReport>;

    /// All chunks of a group, in chunk order.
    async fn chunk_group(&self, group: Uuid) -> Result<Vec<Memory>>;

    async fn lock(&self, id: Uuid) -> Result<()> {
        self.set_locked(id, true).await
    }

    async fn unlock(&self, id: Uuid) -> Result<()> {
        self.set_locked(id, false).await
    }
}

/// Rank candidates the way every backend must: threshold, best first,
/// one per chunk group, then truncate.
pub fn rank<'a, I>(candidates: I, query: &[f32], limit: usize, score_threshold: f32) -> Vec<ScoredMemory>
where
    I: IntoIterator<Item = &'a Memory>,
{
    let mut scored: Vec<(f32, &Memory)> = candidates
        .into_iter()
        .filter(|m| !m.is_hidden())
        .map(|m| (cosine_sim(query, &m.embedding), m))
        .filter(|(score, _)| *score >= score_threshold)
        .collect();
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.1.created_at.cmp(&b.1.created_at))
    });

    let mut seen_groups = HashSet::new();
    scored
        .into_iter()
        .filter(|(_, m)| match m.chunk_group_id {
            Some(group) => seen_groups.insert(group),
            None => true,
        })
        .take(limit)
        .map(|(score, m)| ScoredMemory {
            memory: m.clone(),
            score,
        })
        .collect()
}

/// Exact-scan store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryMemories {
    rows: RwLock<HashMap<Uuid, Memory>>,
}

impl InMemoryMemories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    fn update<F>(&self, id: Uuid, f: F) -> Result<()>
    where
        F: FnOnce(&mut Memory),
    {
        let mut rows = self.rows.write();
        let memory = rows
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("memory {}", id)))?;
        f(memory);
        memory.updated_at = Utc::now();
        Ok(())
    }

    fn remove_unlocked<F>(&self, mut selected: F) -> PurgeReport
    where
        F: FnMut(&Memory) -> bool,
    {
        let mut report = PurgeReport::default();
        self.rows.write().retain(|_, m| {
            if !selected(m) {
                return true;
            }
            if m.locked {
                report.skipped_locked += 1;
                return true;
            }
            report.deleted += 1;
            false
        });
        report
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemories {
    async fn insert(&self, memory: Memory) -> Result<()> {
        debug!(memory_id = %memory.id, personality = %memory.personality_id, "memory inserted");
        self.rows.write().insert(memory.id, memory);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Memory>> {
        Ok(self.rows.read().get(&id).cloned())
    }

    async fn retrieve(
        &self,
        owner: &OwnerScope,
        query: &[f32],
        limit: usize,
        score_threshold: f32,
    ) -> Result<Vec<ScoredMemory>> {
        let rows = self.rows.read();
        Ok(rank(
            rows.values().filter(|m| m.owned_by(owner)),
            query,
            limit,
            score_threshold,
        ))
    }

    async fn list(&self, owner: &OwnerScope, include_hidden: bool) -> Result<Vec<Memory>> {
        let mut listed: Vec<Memory> = self
            .rows
            .read()
            .values()
            .filter(|m| m.owned_by(owner) && (include_hidden || !m.is_hidden()))
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(listed)
    }

    async fn set_locked(&self, id: Uuid, locked: bool) -> Result<()> {
        self.update(id, |m| m.locked = locked)
    }

    async fn set_visibility(&self, id: Uuid, visibility: Visibility) -> Result<()> {
        self.update(id, |m| m.visibility = visibility)
    }

    async fn update_content(&self, id: Uuid, content: String, embedding: Vec<f32>) -> Result<()> {
        self.update(id, |m| {
            m.content = content;
            m.embedding = embedding;
        })
    }

    async fn purge_scope(&self, owner: &OwnerScope) -> Result<PurgeReport> {
        let report = self.remove_unlocked(|m| m.owned_by(owner));
        info!(
            persona = %owner.persona_id,
            personality = %owner.personality_id,
            deleted = report.deleted,
            skipped_locked = report.skipped_locked,
            "memory scope purged"
        );
        Ok(report)
    }

    async fn delete_batch(&self, ids: &[Uuid]) -> Result<PurgeReport> {
        let ids: HashSet<&Uuid> = ids.iter().collect();
        Ok(self.remove_unlocked(|m| ids.contains(&m.id)))
    }

    async fn chunk_group(&self, group: Uuid) -> Result<Vec<Memory>> {
        let mut chunks: Vec<Memory> = self
            .rows
            .read()
            .values()
            .filter(|m| m.chunk_group_id == Some(group))
            .cloned()
            .collect();
        chunks.sort_by_key(|m| m.chunk_index);
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> OwnerScope {
        OwnerScope::new("persona-1", "nova")
    }

    #[test]
    fn test_cosine_sim_identical() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![1.0, 2.0, 3.0];
        assert!((cosine_sim(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_sim_orthogonal() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_sim(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_sim_empty_or_mismatched() {
        assert_eq!(cosine_sim(&[], &[]), 0.0);
        assert_eq!(cosine_sim(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_retrieve_orders_filters_and_limits() {
        let store = InMemoryMemories::new();
        let best = Memory::new(&owner(), "likes tea", vec![1.0, 0.0]);
        let good = Memory::new(&owner(), "likes coffee", vec![0.8, 0.6]);
        let weak = Memory::new(&owner(), "has a cat", vec![0.0, 1.0]);
        let other = Memory::new(&OwnerScope::new("persona-2", "nova"), "someone else", vec![1.0, 0.0]);
        for m in [&best, &good, &weak, &other] {
            store.insert(m.clone()).await.unwrap();
        }

        let hits = store.retrieve(&owner(), &[1.0, 0.0], 10, 0.5).await.unwrap();
        let ids: Vec<Uuid> = hits.iter().map(|h| h.memory.id).collect();
        assert_eq!(ids, vec![best.id, good.id]);
        assert!(hits[0].score >= hits[1].score);

        let top = store.retrieve(&owner(), &[1.0, 0.0], 1, 0.0).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].memory.id, best.id);
    }

    #[tokio::test]
    async fn test_retrieve_one_result_per_chunk_group() {
        let store = InMemoryMemories::new();
        let group = Uuid::new_v4();
        let first = Memory::new(&owner(), "part one", vec![0.9, 0.1]).with_chunk(group, 0);
        let second = Memory::new(&owner(), "part two", vec![1.0, 0.0]).with_chunk(group, 1);
        let loose = Memory::new(&owner(), "unrelated", vec![0.7, 0.7]);
        for m in [&first, &second, &loose] {
            store.insert(m.clone()).await.unwrap();
        }

        let hits = store.retrieve(&owner(), &[1.0, 0.0], 10, 0.1).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].memory.id, second.id);
        assert_eq!(hits[1].memory.id, loose.id);

        let chunks = store.chunk_group(group).await.unwrap();
        assert_eq!(chunks.iter().map(|m| m.chunk_index).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_locked_hidden_memory_survives_purge() {
        let store = InMemoryMemories::new();
        let keep = Memory::new(&owner(), "private detail", vec![1.0, 0.0]);
        let plain = Memory::new(&owner(), "small talk", vec![1.0, 0.0]);
        store.insert(keep.clone()).await.unwrap();
        store.insert(plain.clone()).await.unwrap();

        store.lock(keep.id).await.unwrap();
        store.set_visibility(keep.id, Visibility::Hidden).await.unwrap();

        let hits = store.retrieve(&owner(), &[1.0, 0.0], 10, 0.0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory.id, plain.id);

        assert_eq!(store.list(&owner(), false).await.unwrap().len(), 1);
        assert_eq!(store.list(&owner(), true).await.unwrap().len(), 2);

        let report = store.purge_scope(&owner()).await.unwrap();
        assert_eq!(
            report,
            PurgeReport {
                deleted: 1,
                skipped_locked: 1
            }
        );
        assert!(store.get(keep.id).await.unwrap().is_some());
        assert!(store.get(plain.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_batch_skips_locked_until_unlocked() {
        let store = InMemoryMemories::new();
        let m = Memory::new(&owner(), "pinned", vec![1.0]);
        store.insert(m.clone()).await.unwrap();
        store.lock(m.id).await.unwrap();

        let report = store.delete_batch(&[m.id, Uuid::new_v4()]).await.unwrap();
        assert_eq!(report.deleted, 0);
        assert_eq!(report.skipped_locked, 1);

        store.unlock(m.id).await.unwrap();
        assert_eq!(store.delete_batch(&[m.id]).await.unwrap().deleted, 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_update_content_replaces_embedding() {
        let store = InMemoryMemories::new();
        let m = Memory::new(&owner(), "old", vec![0.0, 1.0]);
        store.insert(m.clone()).await.unwrap();
        store
            .update_content(m.id, "new".into(), vec![1.0, 0.0])
            .await
            .unwrap();

        let updated = store.get(m.id).await.unwrap().unwrap();
        assert_eq!(updated.content, "new");
        assert!(updated.updated_at >= m.updated_at);
        let hits = store.retrieve(&owner(), &[1.0, 0.0], 5, 0.9).await.unwrap();
        assert_eq!(hits.len(), 1);

        let err = store.set_locked(Uuid::new_v4(), true).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
