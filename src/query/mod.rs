//! Query normalization and intent classification.

pub mod intent;
pub mod preprocess;

pub use intent::{QueryIntent, classify_intent};
pub use preprocess::{PreprocessedQuery, preprocess_query, preprocess_query_with};
