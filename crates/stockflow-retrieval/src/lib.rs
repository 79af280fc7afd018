pub mod scorer;
pub mod store;

pub use scorer::{cosine_similarity, RelevanceScorer, Scored};
pub use store::SqliteStore;
