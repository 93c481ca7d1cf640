pub mod address;
pub mod extractor;
pub mod indexer;
pub mod search;
pub mod tree;

pub use indexer::{ResourceIndexer, SyncReport};
pub use search::{SearchFilter, SearchHit};
pub use tree::{TreeNode, TreeNodeKind};
