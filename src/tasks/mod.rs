pub mod scheduler;

pub use scheduler::{FireOutcome, JobScheduler, MaintenanceReport, SchedulerInfo, SchedulerStatus};
