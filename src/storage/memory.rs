//! In-memory section store.
//!
//! Holds everything behind a single `RwLock`, so queries share the lock and
//! each upsert is one write-lock section. Nothing survives the process.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    check_dimension, rank_candidates, similarity, ScoredSection, SectionFilter, SectionStore,
    StorageError, StorageResult, UpsertOutcome,
};
use crate::models::{EmbeddingConfig, PaperSection, SectionKey};

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    config: Option<EmbeddingConfig>,
    sections: HashMap<SectionKey, Entry>,
    next_sequence: i64,
}

#[derive(Debug)]
struct Entry {
    sequence: i64,
    section: PaperSection,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that is already configured with `config`.
    pub fn with_config(config: EmbeddingConfig) -> Self {
        Self {
            state: RwLock::new(State {
                config: Some(config),
                ..State::default()
            }),
        }
    }
}

#[async_trait]
impl SectionStore for InMemoryStore {
    async fn initialize(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn store_config(&self, config: &EmbeddingConfig) -> StorageResult<()> {
        self.state.write().await.config = Some(config.clone());
        Ok(())
    }

    async fn get_config(&self) -> StorageResult<Option<EmbeddingConfig>> {
        Ok(self.state.read().await.config.clone())
    }

    async fn upsert_section(&self, section: &PaperSection) -> StorageResult<UpsertOutcome> {
        let mut state = self.state.write().await;
        let config = state.config.as_ref().ok_or(StorageError::MissingConfig)?;
        check_dimension(config, &section.embedding)?;

        if let Some(entry) = state.sections.get_mut(&section.key) {
            entry.section = section.clone();
            return Ok(UpsertOutcome::Updated);
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.sections.insert(
            section.key.clone(),
            Entry {
                sequence,
                section: section.clone(),
            },
        );
        Ok(UpsertOutcome::Inserted)
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&SectionFilter>,
    ) -> StorageResult<Vec<ScoredSection>> {
        let state = self.state.read().await;
        let Some(config) = state.config.as_ref() else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }
        check_dimension(config, vector)?;

        let candidates = state
            .sections
            .values()
            .filter(|entry| filter.map_or(true, |f| f.matches(&entry.section)))
            .map(|entry| ScoredSection {
                score: similarity(config.metric, vector, &entry.section.embedding),
                section: entry.section.clone(),
                sequence: entry.sequence,
            })
            .collect();

        Ok(rank_candidates(candidates, k))
    }

    async fn count_sections(&self) -> StorageResult<usize> {
        Ok(self.state.read().await.sections.len())
    }

    async fn paper_ids(&self) -> StorageResult<Vec<String>> {
        let state = self.state.read().await;
        let ids: BTreeSet<&str> = state.sections.keys().map(|k| k.paper_id.as_str()).collect();
        Ok(ids.into_iter().map(str::to_string).collect())
    }

    async fn reset(&self) -> StorageResult<()> {
        self.state.write().await.sections.clear();
        Ok(())
    }
}
