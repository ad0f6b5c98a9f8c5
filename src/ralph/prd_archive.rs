//! Archive of completed PRD items, with deterministic-embedding semantic
//! search over the archive.
//!
//! Grounded on `ralph/prd_archive.py`'s `PRDArchive`/`ArchivedPRDItem`:
//! archive-then-prune-in-place against the live PRD file, re-archiving by
//! id replaces the prior record, and search ranks by cosine similarity of
//! a 64-dimension hash-seeded embedding (the crash-safety Open Question
//! from spec.md §9 is resolved here with write-temp-then-rename, per
//! spec.md's own Design Notes recommendation).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::compaction::hash_seeded_embedding;
use crate::models::{ArchivedPrdItem, Chunk, ChunkSource, Scope, SemanticLabel};
use crate::storage::Store;

const SEARCH_EMBEDDING_DIMENSIONS: usize = 64;

pub struct PrdArchive {
    archive_path: PathBuf,
    store: Option<Arc<dyn Store>>,
}

fn string_field(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key).and_then(|v| v.as_str()).unwrap_or("").to_string()
}

fn string_list_field(obj: &Map<String, Value>, keys: &[&str]) -> Vec<String> {
    for key in keys {
        if let Some(Value::Array(items)) = obj.get(*key) {
            return items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect();
        }
    }
    Vec::new()
}

fn archived_item_from_json(value: &Value) -> Option<ArchivedPrdItem> {
    let obj = value.as_object()?;
    let completed_at = obj
        .get("completed_at")
        .and_then(|v| v.as_str())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    Some(ArchivedPrdItem {
        id: string_field(obj, "id"),
        title: string_field(obj, "title"),
        description: string_field(obj, "description"),
        user_story: string_field(obj, "user_story"),
        steps: string_list_field(obj, &["steps"]),
        acceptance_criteria: string_list_field(obj, &["acceptance_criteria", "acceptance"]),
        validation_commands: string_list_field(obj, &["validation_commands", "validation"]),
        completed_at,
        completion_iteration: obj.get("completion_iteration").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        key_decisions: string_list_field(obj, &["key_decisions"]),
        lessons_learned: string_list_field(obj, &["lessons_learned"]),
        related_files: string_list_field(obj, &["related_files"]),
        commit_hashes: string_list_field(obj, &["commit_hashes"]),
    })
}

fn archived_item_to_json(item: &ArchivedPrdItem) -> Value {
    serde_json::json!({
        "id": item.id,
        "title": item.title,
        "description": item.description,
        "user_story": item.user_story,
        "steps": item.steps,
        "acceptance_criteria": item.acceptance_criteria,
        "validation_commands": item.validation_commands,
        "completed_at": item.completed_at.to_rfc3339(),
        "completion_iteration": item.completion_iteration,
        "key_decisions": item.key_decisions,
        "lessons_learned": item.lessons_learned,
        "related_files": item.related_files,
        "commit_hashes": item.commit_hashes,
    })
}

impl PrdArchive {
    pub fn new(agent_dir: impl Into<PathBuf>, store: Option<Arc<dyn Store>>) -> Self {
        let agent_dir = agent_dir.into();
        Self {
            archive_path: agent_dir.join("ralph").join("prd_archive.json"),
            store,
        }
    }

    fn load_archive(&self) -> anyhow::Result<Vec<ArchivedPrdItem>> {
        let text = match std::fs::read_to_string(&self.archive_path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let payload: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(_) => return Ok(Vec::new()),
        };
        let items = payload.get("items").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        Ok(items.iter().filter_map(archived_item_from_json).collect())
    }

    fn save_archive(&self, items: &[ArchivedPrdItem]) -> anyhow::Result<()> {
        if let Some(parent) = self.archive_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::json!({
            "version": 1,
            "updated_at": Utc::now().to_rfc3339(),
            "items": items.iter().map(archived_item_to_json).collect::<Vec<_>>(),
        });
        let tmp_path = self.archive_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, serde_json::to_string_pretty(&payload)?)?;
        std::fs::rename(&tmp_path, &self.archive_path)?;
        Ok(())
    }

    /// Archive one PRD item, replacing any prior record with the same id.
    pub async fn archive_item(
        &self,
        scope: &Scope,
        prd_item: &Value,
        iteration: u32,
    ) -> anyhow::Result<ArchivedPrdItem> {
        let obj = prd_item.as_object().cloned().unwrap_or_default();
        let archived = ArchivedPrdItem {
            id: string_field(&obj, "id"),
            title: string_field(&obj, "title"),
            description: string_field(&obj, "description"),
            user_story: string_field(&obj, "user_story"),
            steps: string_list_field(&obj, &["steps"]),
            acceptance_criteria: string_list_field(&obj, &["acceptance", "acceptance_criteria"]),
            validation_commands: string_list_field(&obj, &["validation", "validation_commands"]),
            completed_at: Utc::now(),
            completion_iteration: iteration,
            key_decisions: string_list_field(&obj, &["key_decisions"]),
            lessons_learned: string_list_field(&obj, &["lessons_learned"]),
            related_files: string_list_field(&obj, &["related_files"]),
            commit_hashes: string_list_field(&obj, &["commit_hashes"]),
        };

        let mut items = self.load_archive()?;
        items.retain(|item| item.id != archived.id);
        items.push(archived.clone());
        self.save_archive(&items)?;
        self.index_archived_item(scope, &archived).await?;
        Ok(archived)
    }

    /// Archive every PRD item with `passes: true` not already archived, then
    /// prune the PRD file of the items just archived (single rewrite).
    pub async fn archive_completed_from_prd(
        &self,
        scope: &Scope,
        prd_path: &Path,
        iteration: u32,
    ) -> anyhow::Result<Vec<ArchivedPrdItem>> {
        let payload: Value = serde_json::from_str(&std::fs::read_to_string(prd_path)?)?;
        let items = payload.get("items").and_then(|v| v.as_array()).cloned().unwrap_or_default();

        let mut existing_ids: HashSet<String> =
            self.load_archive()?.into_iter().map(|item| item.id).collect();
        let mut completed_ids = HashSet::new();
        let mut archived_items = Vec::new();

        for item in &items {
            let Some(obj) = item.as_object() else { continue };
            if !obj.get("passes").and_then(|v| v.as_bool()).unwrap_or(false) {
                continue;
            }
            let item_id = string_field(obj, "id");
            if item_id.is_empty() {
                continue;
            }
            if existing_ids.contains(&item_id) {
                completed_ids.insert(item_id);
                continue;
            }
            archived_items.push(self.archive_item(scope, item, iteration).await?);
            existing_ids.insert(item_id.clone());
            completed_ids.insert(item_id);
        }

        if !completed_ids.is_empty() {
            self.prune_prd_items(prd_path, &completed_ids)?;
        }
        Ok(archived_items)
    }

    /// Remove from the PRD any passing items already present in the
    /// archive. Returns the number pruned.
    pub fn prune_archived_from_prd(&self, prd_path: &Path) -> anyhow::Result<usize> {
        let archived_ids: HashSet<String> = self.load_archive()?.into_iter().map(|item| item.id).collect();
        if archived_ids.is_empty() {
            return Ok(0);
        }
        let payload: Value = serde_json::from_str(&std::fs::read_to_string(prd_path)?)?;
        let items = payload.get("items").and_then(|v| v.as_array()).cloned().unwrap_or_default();

        let mut to_prune = HashSet::new();
        for item in &items {
            let Some(obj) = item.as_object() else { continue };
            if !obj.get("passes").and_then(|v| v.as_bool()).unwrap_or(false) {
                continue;
            }
            let item_id = string_field(obj, "id");
            if !item_id.is_empty() && archived_ids.contains(&item_id) {
                to_prune.insert(item_id);
            }
        }
        if to_prune.is_empty() {
            return Ok(0);
        }
        self.prune_prd_items(prd_path, &to_prune)
    }

    fn prune_prd_items(&self, prd_path: &Path, archived_ids: &HashSet<String>) -> anyhow::Result<usize> {
        if archived_ids.is_empty() {
            return Ok(0);
        }
        let mut payload: Value = serde_json::from_str(&std::fs::read_to_string(prd_path)?)?;
        let Some(items) = payload.get("items").and_then(|v| v.as_array()).cloned() else {
            return Ok(0);
        };

        let original_count = items.len();
        let filtered: Vec<Value> = items
            .into_iter()
            .filter(|item| {
                let Some(obj) = item.as_object() else { return true };
                let passes = obj.get("passes").and_then(|v| v.as_bool()).unwrap_or(false);
                let item_id = string_field(obj, "id");
                !(passes && archived_ids.contains(&item_id))
            })
            .collect();

        let removed = original_count - filtered.len();
        if removed > 0 {
            payload["items"] = Value::Array(filtered);
            std::fs::write(prd_path, serde_json::to_string_pretty(&payload)?)?;
        }
        Ok(removed)
    }

    pub fn get_by_id(&self, item_id: &str) -> anyhow::Result<Option<ArchivedPrdItem>> {
        Ok(self.load_archive()?.into_iter().find(|item| item.id == item_id))
    }

    pub fn list_all(&self) -> anyhow::Result<Vec<ArchivedPrdItem>> {
        self.load_archive()
    }

    async fn index_archived_item(&self, scope: &Scope, item: &ArchivedPrdItem) -> anyhow::Result<()> {
        let Some(store) = self.store.as_ref() else { return Ok(()) };
        let text = item.searchable_text();
        let embedding = hash_seeded_embedding(&text, SEARCH_EMBEDDING_DIMENSIONS);
        let chunk = Chunk {
            id: Uuid::new_v4(),
            scope: scope.clone(),
            source: ChunkSource::Import,
            source_ids: Vec::new(),
            content: text,
            label: SemanticLabel::Decision,
            tags: vec!["prd".to_string(), "archived".to_string(), item.id.to_lowercase()],
            created_at: Utc::now(),
            token_count: None,
            embedding: Some(embedding),
        };
        store.store_chunk(&chunk).await?;
        Ok(())
    }

    /// Rank archived items by cosine similarity of their deterministic
    /// searchable-text embedding against `query`'s.
    pub fn search(
        &self,
        query: &str,
        top_k: usize,
        item_ids: Option<&[String]>,
    ) -> anyhow::Result<Vec<(ArchivedPrdItem, f64)>> {
        let items = self.load_archive()?;
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let query_embedding = hash_seeded_embedding(query, SEARCH_EMBEDDING_DIMENSIONS);
        let allowed_ids: Option<HashSet<String>> =
            item_ids.map(|ids| ids.iter().map(|id| id.to_lowercase()).collect());

        let mut scored: Vec<(ArchivedPrdItem, f64)> = items
            .into_iter()
            .filter(|item| {
                allowed_ids
                    .as_ref()
                    .map(|allowed| allowed.contains(&item.id.to_lowercase()))
                    .unwrap_or(true)
            })
            .map(|item| {
                let item_embedding = hash_seeded_embedding(&item.searchable_text(), SEARCH_EMBEDDING_DIMENSIONS);
                let score = cosine_similarity(&query_embedding, &item_embedding);
                (item, score)
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        (dot / denom) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_prd_item(id: &str, passes: bool) -> Value {
        serde_json::json!({
            "id": id,
            "title": format!("Item {id}"),
            "description": "does a thing",
            "user_story": "as a user",
            "steps": ["do step one"],
            "acceptance": ["criteria met"],
            "validation": ["cargo test"],
            "passes": passes,
        })
    }

    #[tokio::test]
    async fn archive_item_replaces_prior_record_by_id() {
        let dir = tempdir().unwrap();
        let archive = PrdArchive::new(dir.path(), None);
        let scope = Scope::default_scope();
        archive.archive_item(&scope, &sample_prd_item("ITEM-1", true), 1).await.unwrap();
        archive.archive_item(&scope, &sample_prd_item("ITEM-1", true), 2).await.unwrap();
        let all = archive.list_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].completion_iteration, 2);
    }

    #[tokio::test]
    async fn archive_completed_from_prd_prunes_archived_items() {
        let dir = tempdir().unwrap();
        let prd_path = dir.path().join("prd.json");
        std::fs::write(
            &prd_path,
            serde_json::to_string(&serde_json::json!({
                "items": [sample_prd_item("ITEM-1", true), sample_prd_item("ITEM-2", false)]
            }))
            .unwrap(),
        )
        .unwrap();

        let archive = PrdArchive::new(dir.path(), None);
        let scope = Scope::default_scope();
        let archived = archive
            .archive_completed_from_prd(&scope, &prd_path, 3)
            .await
            .unwrap();
        assert_eq!(archived.len(), 1);

        let remaining: Value = serde_json::from_str(&std::fs::read_to_string(&prd_path).unwrap()).unwrap();
        let items = remaining["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["id"], "ITEM-2");
    }

    #[test]
    fn search_ranks_by_cosine_similarity_and_respects_item_filter() {
        let dir = tempdir().unwrap();
        let archive = PrdArchive::new(dir.path(), None);
        let items = vec![
            ArchivedPrdItem {
                id: "A".to_string(),
                title: "parser".to_string(),
                description: "parse config files".to_string(),
                user_story: String::new(),
                steps: Vec::new(),
                acceptance_criteria: Vec::new(),
                validation_commands: Vec::new(),
                completed_at: Utc::now(),
                completion_iteration: 1,
                key_decisions: Vec::new(),
                lessons_learned: Vec::new(),
                related_files: Vec::new(),
                commit_hashes: Vec::new(),
            },
            ArchivedPrdItem {
                id: "B".to_string(),
                title: "unrelated".to_string(),
                description: "totally different topic".to_string(),
                user_story: String::new(),
                steps: Vec::new(),
                acceptance_criteria: Vec::new(),
                validation_commands: Vec::new(),
                completed_at: Utc::now(),
                completion_iteration: 1,
                key_decisions: Vec::new(),
                lessons_learned: Vec::new(),
                related_files: Vec::new(),
                commit_hashes: Vec::new(),
            },
        ];
        archive.save_archive(&items).unwrap();

        let results = archive.search("parser", 5, Some(&["A".to_string()])).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.id, "A");
    }
}
