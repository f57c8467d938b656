// # Coordinator Side
//
// The coordinator owns user queries end to end: it journals the query,
// splits the rewritten per-chunk fragments into per-worker bundles,
// dispatches each bundle, pulls result files back through the merger, and
// converts the aggregate outcome into a terminal query status.

pub mod bundle;
pub mod dispatcher;
pub mod http;
pub mod merger;
pub mod registry;

pub use bundle::{BundleSender, BundleState, FragmentSpec, Job};
pub use dispatcher::{ChunkQuerySpec, Coordinator, QueryDispatcher, QuerySpec};
pub use merger::{MergeTask, ResultMerger};
pub use registry::ChunkPlacement;
