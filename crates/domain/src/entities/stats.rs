use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::TaskState;

/// 作业运行的任务进度统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRunStats {
    pub tasks_by_state: HashMap<TaskState, i64>,
    pub tasks_failed: i64,
    pub tasks_succeeded: i64,
    pub tasks_total: i64,
    pub duration_total_mins: Option<f64>,
    pub duration_prep_mins: Option<f64>,
    pub duration_finalize_mins: Option<f64>,
}

impl JobRunStats {
    pub fn count(&self, state: TaskState) -> i64 {
        self.tasks_by_state.get(&state).copied().unwrap_or(0)
    }

    /// 完成百分比：100 表示全部 DONE 或 CANCELLED，0 表示没有任务或全都未结束，
    /// 其余为 1-99 的近似值
    pub fn percent_done(&self) -> u8 {
        let finished = self.count(TaskState::Done) + self.count(TaskState::Cancelled);
        let unfinished = self.count(TaskState::Pending) + self.count(TaskState::Running);
        if self.tasks_total == 0 || self.tasks_total == unfinished {
            0
        } else if self.tasks_total == finished {
            100
        } else {
            approx_percent(finished, self.tasks_total)
        }
    }

    /// 成功百分比，仅当全部任务 DONE 时有值：100 全部成功，0 全部失败
    pub fn percent_success(&self) -> Option<u8> {
        if self.tasks_total == 0 || self.count(TaskState::Done) != self.tasks_total {
            return None;
        }
        Some(if self.tasks_succeeded == self.tasks_total {
            100
        } else if self.tasks_failed == self.tasks_total {
            0
        } else {
            approx_percent(self.tasks_succeeded, self.tasks_total)
        })
    }
}

fn approx_percent(part: i64, total: i64) -> u8 {
    let percent = (part as f64 * (100.0 / total as f64)) as i64;
    jobs_core::clamp(1, 99, percent) as u8
}
