//! Folder analysis
//!
//! A [`FolderSnapshot`] is taken once per run, the [`PatternDetector`] turns
//! each self-contained directory into signals, and the [`TopologyAnalyzer`]
//! ranks the resulting candidates into recommendations.

mod detector;
mod snapshot;
mod templates;
mod topology;


pub use detector::{PatternDetector, PatternSignals};
pub use snapshot::FolderSnapshot;
pub use topology::TopologyAnalyzer;
