pub mod chunk;
pub mod engine;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod task;
pub mod throttle;
pub mod transport;

pub use chunk::{ByteRangeChunk, ChunkManager, ChunkState, ChunkStatus};
pub use engine::{DownloadEngine, FailureReport};
pub use progress::{DownloadProgress, GlobalProgress, ProgressTracker, SpeedCalculator};
pub use queue::{Priority, PriorityDownloadItem, PriorityDownloadQueue};
pub use retry::RetryPolicy;
pub use task::{DownloadTask, TaskStatus};
pub use throttle::BandwidthLimiter;
pub use transport::{HttpFetcher, RangeFetcher, RemoteResource};
