pub mod repository;
pub mod vector_index;

pub use repository::{KgRepository, TableContext};
pub use vector_index::{ScoredEntity, VectorIndex};
