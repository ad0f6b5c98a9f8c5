//! Context assembler: composes the markdown bundle an agent reads before
//! starting work, combining the three curated tiers with a relevance
//! search over indexed chunks.
//!
//! The hybrid-merge shape (fetch candidates from each backend, normalize,
//! combine, truncate) follows the teacher's `search.rs`
//! (`normalize_scores`/`fetch_keyword_candidates`/`fetch_vector_candidates`)
//! retargeted from `Document`/FTS-only keyword search to `LogEntry`-backed
//! `Chunk`s, with the teacher's α-blend replaced by reciprocal-rank-fusion
//! per the retrieval config's `fusion_k`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::compaction::hash_seeded_embedding;
use crate::config::RetrievalConfig;
use crate::models::{Chunk, Scope, TierFile};
use crate::storage::Store;
use crate::tier_store::{TierWriter, WritePolicy};

/// One scored chunk returned from [`RetrievalEngine::search`].
#[derive(Debug, Clone)]
pub struct RetrievedEntry {
    pub chunk: Chunk,
    pub score: f64,
}

pub struct RetrievalEngine {
    store: Arc<dyn Store>,
    tiers: TierWriter,
    retrieval: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<dyn Store>,
        root: impl Into<std::path::PathBuf>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            tiers: TierWriter::new(root, WritePolicy::default()),
            retrieval,
        }
    }

    /// Render the full `# Context for: <task>` markdown bundle.
    pub async fn assemble_bundle(&self, scope: &Scope, task: &str) -> anyhow::Result<String> {
        let guardrails = self.tiers.read_tier(TierFile::Guardrails)?;
        let style = self.tiers.read_tier(TierFile::Style)?;
        let recent = self.tiers.read_tier(TierFile::Recent)?;
        let relevant = self.search(scope, task).await?;
        Ok(render_bundle(task, &guardrails, &style, &recent, &relevant))
    }

    /// Rank chunks relevant to `query` using the configured backend.
    pub async fn search(&self, scope: &Scope, query: &str) -> anyhow::Result<Vec<RetrievedEntry>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let top_k = self.retrieval.top_k.max(1);
        let candidate_k = if self.retrieval.rerank_enabled {
            self.retrieval.rerank_candidate_k.max(top_k)
        } else {
            top_k
        };

        let fts_candidates = self.store.search_chunks_fts(scope, query, candidate_k).await?;

        let fused: Vec<RetrievedEntry> = if self.retrieval.backend == "hybrid" {
            let embedded_chunks = self.store.list_chunks_with_embeddings(scope).await?;
            let query_embedding =
                hash_seeded_embedding(query, self.retrieval.embedding_dimensions.max(8));
            let vector_ranked = rank_by_cosine(&embedded_chunks, &query_embedding, candidate_k as usize);
            reciprocal_rank_fusion(&fts_candidates, &vector_ranked, self.retrieval.fusion_k)
        } else {
            // `raw_score` is a bm25 rank (lower is a better match); negate so
            // this function's score convention ("higher is better") holds
            // uniformly for both backends.
            fts_candidates
                .into_iter()
                .map(|c| RetrievedEntry {
                    chunk: c.chunk,
                    score: -c.raw_score,
                })
                .collect()
        };

        let mut fused = fused;
        fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        fused.truncate(top_k as usize);
        Ok(fused)
    }
}

fn rank_by_cosine(chunks: &[Chunk], query_embedding: &[f32], limit: usize) -> Vec<(Chunk, f64)> {
    let mut scored: Vec<(Chunk, f64)> = chunks
        .iter()
        .filter_map(|chunk| {
            chunk
                .embedding
                .as_ref()
                .map(|vector| (chunk.clone(), cosine_similarity(query_embedding, vector) as f64))
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    scored
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
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
        dot / denom
    }
}

/// Combine FTS and vector candidate rankings via reciprocal-rank-fusion:
/// `score(chunk) = sum over lists containing it of 1 / (fusion_k + rank)`,
/// rank 1-indexed. A chunk present in both lists accumulates both terms.
fn reciprocal_rank_fusion(
    fts_candidates: &[crate::storage::ChunkCandidate],
    vector_candidates: &[(Chunk, f64)],
    fusion_k: i64,
) -> Vec<RetrievedEntry> {
    let k = fusion_k.max(1) as f64;
    let mut scores: HashMap<uuid::Uuid, f64> = HashMap::new();
    let mut chunks: HashMap<uuid::Uuid, Chunk> = HashMap::new();

    for (rank, candidate) in fts_candidates.iter().enumerate() {
        let id = candidate.chunk.id;
        *scores.entry(id).or_insert(0.0) += 1.0 / (k + (rank + 1) as f64);
        chunks.entry(id).or_insert_with(|| candidate.chunk.clone());
    }
    for (rank, (chunk, _similarity)) in vector_candidates.iter().enumerate() {
        let id = chunk.id;
        *scores.entry(id).or_insert(0.0) += 1.0 / (k + (rank + 1) as f64);
        chunks.entry(id).or_insert_with(|| chunk.clone());
    }

    scores
        .into_iter()
        .filter_map(|(id, score)| chunks.remove(&id).map(|chunk| RetrievedEntry { chunk, score }))
        .collect()
}

fn render_bundle(
    task: &str,
    guardrails: &str,
    style: &str,
    recent: &str,
    relevant: &[RetrievedEntry],
) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Context for: {task}\n\n"));
    out.push_str("## Guardrails\n");
    out.push_str(if guardrails.trim().is_empty() { "(none yet)\n" } else { guardrails.trim_end() });
    out.push_str("\n\n## Style\n");
    out.push_str(if style.trim().is_empty() { "(none yet)\n" } else { style.trim_end() });
    out.push_str("\n\n## Recent\n");
    out.push_str(if recent.trim().is_empty() { "(none yet)\n" } else { recent.trim_end() });
    out.push_str(&format!("\n\n## Relevant to \"{task}\"\n"));
    if relevant.is_empty() {
        out.push_str("(no matching entries)\n");
    } else {
        for (index, entry) in relevant.iter().enumerate() {
            let tags = entry.chunk.tags.join(", ");
            out.push_str(&format!(
                "{}. ({}) {} [{}]\n",
                index + 1,
                entry.chunk.label.as_str(),
                entry.chunk.content,
                tags
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkSource, SemanticLabel};
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_chunk(content: &str, label: SemanticLabel, embedding: Option<Vec<f32>>) -> Chunk {
        Chunk {
            id: Uuid::new_v4(),
            scope: Scope::default_scope(),
            source: ChunkSource::LogEntry,
            source_ids: Vec::new(),
            content: content.to_string(),
            label,
            tags: vec!["rust".to_string()],
            created_at: Utc::now(),
            token_count: None,
            embedding,
        }
    }

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let v = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn rank_by_cosine_skips_chunks_without_embedding() {
        let with_vec = sample_chunk("has embedding", SemanticLabel::Pattern, Some(vec![1.0, 0.0]));
        let without_vec = sample_chunk("no embedding", SemanticLabel::Pattern, None);
        let ranked = rank_by_cosine(&[with_vec.clone(), without_vec], &[1.0, 0.0], 5);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].0.id, with_vec.id);
    }

    #[test]
    fn render_bundle_numbers_relevant_entries() {
        let chunk = sample_chunk("always validate input", SemanticLabel::Gotcha, None);
        let entries = vec![RetrievedEntry { chunk, score: 0.9 }];
        let bundle = render_bundle("fix parser", "", "", "", &entries);
        assert!(bundle.contains("# Context for: fix parser"));
        assert!(bundle.contains("1. (gotcha) always validate input [rust]"));
    }
}
