pub mod concurrency;
pub mod config;
pub mod time;

pub use concurrency::{go_items, go_timed_items, GoItemsReport, ItemTimeout};
pub use config::{EngineConfig, JobsConfig, ObservabilityConfig};
pub use jobs_errors::*;
pub use time::{ManualTimeProvider, SystemTimeProvider, TimeProvider};

/// 把 `value` 限制在 `[min, max]` 内
pub fn clamp<T: PartialOrd>(min: T, max: T, value: T) -> T {
    if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    }
}
