pub mod api;
pub mod bundle;
pub mod config;
pub mod error;
pub mod index;
pub mod merge;
pub mod partition;
pub mod results;
pub mod transport;

pub use api::*;
pub use bundle::{default_steps, package, unpack, Step};
pub use config::TransportConfig;
pub use error::{DispatchError, Result};
pub use index::{FlatL2Index, Neighbor, VectorIndex};
pub use merge::{merge, MergeOutcome, MergedIndex, ResultShard, SearchHit};
pub use partition::{split_dir, Distribution, Partition, SplitMode, SplitReport};
pub use results::package_results;
pub use transport::{Connection, ConnectionState, Incoming, TransportEvent, TransportListener};
