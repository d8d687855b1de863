// Embedding engine for memory vectors
//
// Semantic quality is the vector store's concern; the daemon only needs a
// deterministic text -> vector mapping so the same words always land in the
// same dimensions, across restarts and builds.

use sha2::{Digest, Sha256};

/// Trait for embedding engines
pub trait EmbeddingEngine: Send + Sync {
    /// Generate embedding vector for text
    fn embed(&self, text: &str) -> Vec<f32>;

    /// Get embedding dimension
    fn dimension(&self) -> usize;
}

/// Feature-hashing embedding over lowercase word tokens.
///
/// Each token is hashed with SHA-256 and spread over four dimensions; the
/// result is normalised to a unit vector.
pub struct HashingEmbedding {
    dimension: usize,
}

impl HashingEmbedding {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

impl EmbeddingEngine for HashingEmbedding {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimension];

        let tokens = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase);

        for token in tokens {
            let digest = Sha256::digest(token.as_bytes());
            for j in 0..4 {
                let chunk = [digest[j * 4], digest[j * 4 + 1], digest[j * 4 + 2], digest[j * 4 + 3]];
                let idx = u32::from_le_bytes(chunk) as usize % self.dimension;
                embedding[idx] += 1.0;
            }
        }

        // Normalize to unit vector
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut embedding {
                *x /= norm;
            }
        }
        embedding
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Compute cosine similarity between two embeddings
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
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
