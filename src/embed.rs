//! Local deterministic embedder for the CLI. No network, no model
//! weights: a character n-gram hash projection that is stable across
//! runs, which is all the relevance scorer needs to be exercised.

use futures::future::BoxFuture;

use stockflow_core::traits::Embedder;
use stockflow_core::Result;

const DIMENSIONS: usize = 64;

pub struct HashEmbedder;

impl HashEmbedder {
    fn embed_one(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; DIMENSIONS];
        let lowered = text.to_lowercase();
        let bytes = lowered.as_bytes();
        for window in bytes.windows(3) {
            let mut hash = 2166136261u32;
            for b in window {
                hash ^= u32::from(*b);
                hash = hash.wrapping_mul(16777619);
            }
            v[(hash as usize) % DIMENSIONS] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, texts: &[String]) -> BoxFuture<'_, Result<Vec<Vec<f32>>>> {
        let vectors: Vec<Vec<f32>> = texts.iter().map(|t| Self::embed_one(t)).collect();
        Box::pin(async move { Ok(vectors) })
    }

    fn dimensions(&self) -> usize {
        DIMENSIONS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockflow_retrieval::cosine_similarity;

    #[test]
    fn test_vectors_are_unit_length_and_stable() {
        let a = HashEmbedder::embed_one("semiconductor supply chains");
        let b = HashEmbedder::embed_one("Semiconductor Supply Chains");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_related_texts_score_higher() {
        let query = HashEmbedder::embed_one("apple iphone revenue growth");
        let related = HashEmbedder::embed_one("iphone revenue grew strongly for apple");
        let unrelated = HashEmbedder::embed_one("crude oil pipeline maintenance schedule");
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }
}
