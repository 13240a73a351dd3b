//! Test data builders for creating test entities
//!
//! Builders start from sensible defaults and only the fields a test cares
//! about need to be set.

use chrono::{DateTime, TimeZone, Utc};
use jobs_domain::{
    CancellationReason, JobDef, JobRun, JobTask, PayloadMap, RunState, Schedule, TaskAttempt,
    TaskState,
};

/// Fixed reference instant used by builders and the test engine clock
pub fn test_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 9, 2, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Builder for creating test JobDef entities
pub struct JobDefBuilder {
    def: JobDef,
}

impl JobDefBuilder {
    pub fn new(id: &str, handler_id: &str) -> Self {
        Self {
            def: JobDef::new(id, handler_id),
        }
    }

    pub fn with_schedule(mut self, crontab: &str) -> Self {
        self.def.schedules.push(Schedule::new(crontab));
        self
    }

    pub fn with_disabled_schedule(mut self, crontab: &str) -> Self {
        self.def.schedules.push(Schedule::new(crontab).disabled());
        self
    }

    pub fn with_task_retries(mut self, retries: u32) -> Self {
        self.def.task_retries = retries;
        self
    }

    pub fn with_task_timeout_secs(mut self, secs: u64) -> Self {
        self.def.timeouts.task_run_secs = secs;
        self
    }

    pub fn with_delete_after_days(mut self, days: u32) -> Self {
        self.def.delete_after_days = days;
        self
    }

    pub fn allow_manual_job_runs(mut self) -> Self {
        self.def.allow_manual_job_runs = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.def.disabled = true;
        self
    }

    pub fn with_default_details(mut self, details: PayloadMap) -> Self {
        self.def.default_job_details = Some(details);
        self
    }

    pub fn quiet(mut self) -> Self {
        self.def.log_job_lifecycle_events = Some(false);
        self.def.log_task_lifecycle_events = Some(false);
        self
    }

    pub fn build(self) -> JobDef {
        self.def
    }
}

/// Builder for creating test JobRun entities
pub struct JobRunBuilder {
    run: JobRun,
}

impl JobRunBuilder {
    pub fn new(id: &str, def: &JobDef) -> Self {
        let mut run = JobRun::new_pending(id, &def.id, &def.handler_id, test_epoch());
        run.scheduled_next_after = format!("_manual_{id}");
        Self { run }
    }

    pub fn with_state(mut self, state: RunState) -> Self {
        self.run.state = state;
        self
    }

    pub fn with_due_time(mut self, due_time: DateTime<Utc>) -> Self {
        self.run.due_time = due_time;
        self
    }

    pub fn auto_scheduled_after(mut self, previous: &str) -> Self {
        self.run.auto_scheduled = true;
        self.run.scheduled_next_after = previous.to_string();
        self
    }

    pub fn started_at(mut self, start_time: DateTime<Utc>) -> Self {
        self.run.start_time = Some(start_time);
        self
    }

    pub fn finished_at(mut self, finish_time: DateTime<Utc>) -> Self {
        self.run.finish_time = Some(finish_time);
        self
    }

    pub fn with_details(mut self, details: PayloadMap) -> Self {
        self.run.details = Some(details);
        self
    }

    pub fn cancelled_because(mut self, reason: CancellationReason) -> Self {
        self.run.cancellation_reason = Some(reason);
        self
    }

    pub fn build(self) -> JobRun {
        self.run
    }
}

/// Builder for creating test JobTask entities
pub struct JobTaskBuilder {
    task: JobTask,
}

impl JobTaskBuilder {
    pub fn new(run: &JobRun, n: usize) -> Self {
        Self {
            task: JobTask::new_pending(&run.id, n, &run.handler_id, None),
        }
    }

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.task.state = state;
        self
    }

    pub fn with_details(mut self, details: PayloadMap) -> Self {
        self.task.details = Some(details);
        self
    }

    pub fn started_at(mut self, start_time: DateTime<Utc>) -> Self {
        self.task.start_time = Some(start_time);
        self.task.attempts.insert(
            0,
            TaskAttempt {
                time: start_time,
                error: None,
            },
        );
        self
    }

    /// Marks the task DONE with an error on its latest attempt
    pub fn failed_at(mut self, finish_time: DateTime<Utc>, error: &str) -> Self {
        if self.task.attempts.is_empty() {
            self.task.begin_attempt(finish_time);
        }
        self.task.set_latest_error_if_none(error);
        self.task.state = TaskState::Done;
        self.task.finish_time = Some(finish_time);
        self
    }

    pub fn build(self) -> JobTask {
        self.task
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_link_entities() {
        let def = JobDefBuilder::new("nightly", "report")
            .with_schedule("0 3 * * *")
            .with_task_retries(2)
            .build();
        let run = JobRunBuilder::new("nightly_1", &def)
            .with_state(RunState::Running)
            .build();
        let task = JobTaskBuilder::new(&run, 1)
            .failed_at(test_epoch(), "boom")
            .build();

        assert_eq!(run.job_def_id, "nightly");
        assert_eq!(task.id, "nightly_1_1");
        assert!(task.failed());
        assert_eq!(task.latest_error(), Some("boom"));
    }
}
