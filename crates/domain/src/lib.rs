pub mod crontab;
pub mod entities;
pub mod filters;
pub mod payload;
pub mod repositories;

pub use crontab::{CrontabExpr, MAX_SEARCH_DAYS};
pub use entities::*;
pub use filters::{Filter, JobDefFilter, JobRunFilter, JobTaskFilter};
pub use payload::{from_payload_map, to_payload_map, PayloadMap};
pub use repositories::*;
