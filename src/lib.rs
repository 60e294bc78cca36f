//! Incremental update client: fetches published versions from one of several
//! servers and applies them to a local directory.

pub mod apply;
pub mod binary_diff;
pub mod binary_patch;
pub mod config;
pub mod container;
pub mod engine;
pub mod error;
pub mod hashing;
pub mod metadata;
pub mod progress;
pub mod publish;
pub mod rolling_hash;
pub mod servers;
pub mod transport;
pub mod util;
pub mod version;

pub use config::{Config, Layout, PatchFormat};
pub use engine::{run, UpdateEngine, UpdateTask};
pub use error::{RunError, UpdateError};
pub use progress::{LogProgress, ProgressSink};
pub use publish::{publish_version, PublishSummary};
