// Embeddings ("memories") and the brute-force similarity search over them.
//
// A guild rarely has more than a few hundred entries, so a linear scan over
// every stored vector is all the index we need.

use super::settings_store::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A named piece of text and its vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub name: String,
    pub text: String,
    pub vector: Vec<f32>,
    /// Created by the model (memory functions / reactions) rather than an admin.
    pub ai_created: bool,
    pub created_at: i64,
    pub modified_at: i64,
}

impl Embedding {
    pub fn new(name: impl Into<String>, text: impl Into<String>, vector: Vec<f32>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            name: name.into(),
            text: text.into(),
            vector,
            ai_created: false,
            created_at: now,
            modified_at: now,
        }
    }
}

/// A search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct RelatedEmbedding {
    pub name: String,
    pub text: String,
    pub score: f32,
    pub dimensions: usize,
}

/// Persistence for embeddings, scoped by guild.
#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    async fn get(&self, guild_id: u64, name: &str) -> Result<Option<Embedding>, StoreError>;

    /// All entries for a guild, sorted by name.
    async fn list(&self, guild_id: u64) -> Result<Vec<Embedding>, StoreError>;

    /// Inserts or replaces the entry with the same name.
    async fn upsert(&self, guild_id: u64, embedding: Embedding) -> Result<(), StoreError>;

    /// Returns false if no entry had that exact name.
    async fn delete(&self, guild_id: u64, name: &str) -> Result<bool, StoreError>;

    /// Removes every entry for a guild, returning how many were removed.
    async fn clear(&self, guild_id: u64) -> Result<u64, StoreError>;

    async fn count(&self, guild_id: u64) -> Result<u64, StoreError>;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    dot_product / (magnitude_a * magnitude_b)
}

/// Ranks `entries` against `query`.
///
/// Entries with a different dimension are skipped (they were embedded with a
/// different model), anything under `min_relatedness` is dropped, and the
/// rest come back best-first, at most `top_n` of them.
pub fn get_related_embeddings(
    entries: &[Embedding],
    query: &[f32],
    top_n: usize,
    min_relatedness: f32,
) -> Vec<RelatedEmbedding> {
    if top_n == 0 || query.is_empty() || entries.is_empty() {
        return Vec::new();
    }

    let mut related: Vec<RelatedEmbedding> = entries
        .iter()
        .filter(|e| e.vector.len() == query.len())
        .map(|e| RelatedEmbedding {
            name: e.name.clone(),
            text: e.text.clone(),
            score: cosine_similarity(query, &e.vector),
            dimensions: e.vector.len(),
        })
        .filter(|r| r.score >= min_relatedness)
        .collect();

    related.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    related.truncate(top_n);
    related
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, vector: Vec<f32>) -> Embedding {
        Embedding::new(name, format!("{} text", name), vector)
    }

    #[test]
    fn cosine_of_identical_and_orthogonal() {
        assert!((cosine_similarity(&[1.0, 2.0], &[1.0, 2.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn related_sorted_descending_and_filtered() {
        let entries = vec![
            entry("far", vec![0.0, 1.0]),
            entry("close", vec![1.0, 0.1]),
            entry("closest", vec![1.0, 0.0]),
            entry("medium", vec![1.0, 0.6]),
        ];

        let related = get_related_embeddings(&entries, &[1.0, 0.0], 10, 0.8);

        let names: Vec<&str> = related.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["closest", "close", "medium"]);
        assert!(related.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(related.iter().all(|r| r.score >= 0.8));
    }

    #[test]
    fn related_respects_top_n_and_dimensions() {
        let entries = vec![
            entry("a", vec![1.0, 0.0]),
            entry("b", vec![0.9, 0.1]),
            entry("wrong_dims", vec![1.0, 0.0, 0.0]),
        ];

        let related = get_related_embeddings(&entries, &[1.0, 0.0], 1, 0.0);
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].name, "a");
        assert_eq!(related[0].dimensions, 2);

        let related = get_related_embeddings(&entries, &[1.0, 0.0], 5, 0.0);
        assert!(related.iter().all(|r| r.name != "wrong_dims"));
    }

    #[test]
    fn no_results_for_empty_inputs() {
        let entries = vec![entry("a", vec![1.0])];
        assert!(get_related_embeddings(&entries, &[], 3, 0.0).is_empty());
        assert!(get_related_embeddings(&entries, &[1.0], 0, 0.0).is_empty());
        assert!(get_related_embeddings(&[], &[1.0], 3, 0.0).is_empty());
    }
}
