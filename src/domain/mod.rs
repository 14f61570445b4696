pub mod cadence;
pub mod health;
pub mod job;
pub mod opportunity;
pub mod types;

pub use cadence::{Cadence, CadenceError};
pub use health::SiteHealthRecord;
pub use job::{CrawlJobSpec, JobKind, JobRunMetadata, JobStateRecord};
pub use opportunity::OpportunityCandidate;
pub use types::{AlertEvent, AlertKind, RunResult, Tier};
