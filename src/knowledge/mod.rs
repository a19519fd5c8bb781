pub mod anchors;
pub mod edges;
pub mod expand;
pub mod file_learnings;
pub mod learnings;
pub mod model;

pub use anchors::AnchorService;
pub use edges::EdgeService;
pub use expand::GraphExpansion;
pub use file_learnings::FileLearningStore;
pub use learnings::LearningStore;
pub use model::{Anchor, AnchorKind, AnchorStatus, Edge, Learning, LearningSource, NodeKind};
