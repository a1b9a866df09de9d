pub mod difference;
pub mod filter;
pub mod lister;
pub mod mirror;
pub mod mirror_url;
pub mod parallel;
pub mod status;
pub mod urls;
pub mod watch;

pub use difference::{object_difference, DiffMessage, DiffOptions, DiffType};
pub use filter::{AgeFilter, ExcludeFilter};
pub use lister::ContentLister;
pub use mirror::{run_mirror, JobState, MirrorJob, MirrorOutcome, RetryBackoff};
pub use mirror_url::{check_mirror_syntax, prepare_mirror_urls, Endpoint, MirrorOptions};
pub use parallel::{Lane, ParallelManager};
pub use status::{new_status, OutputConfig, Status};
pub use urls::{TaskKind, Urls};
pub use watch::Watcher;
