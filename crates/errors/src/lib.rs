use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobsError {
    #[error("存储错误: {0}")]
    Storage(String),
    #[error("版本冲突: {kind} '{id}' 期望版本 {expected}")]
    VersionConflict {
        kind: &'static str,
        id: String,
        expected: i64,
    },
    #[error("作业定义未找到: {id}")]
    JobDefNotFound { id: String },
    #[error("job def '{id}' renamed or removed in configuration")]
    JobDefRemoved { id: String },
    #[error("job def '{def_id}' handler '{handler_id}' renamed or removed")]
    HandlerRemoved { def_id: String, handler_id: String },
    #[error("job '{id}' no longer exists")]
    JobRunNotFound { id: String },
    #[error("作业任务未找到: {id}")]
    JobTaskNotFound { id: String },
    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },
    #[error("无效的作业定义: {0}")]
    InvalidJobDef(String),
    #[error("处理器已注册: {0}")]
    HandlerAlreadyRegistered(String),
    #[error("无效的处理器载荷类型: {0}")]
    InvalidHandlerPayload(String),
    #[error("状态不允许此操作: {0}")]
    InvalidState(String),
    #[error("cannot create off-schedule job run for job def '{def_id}' because it is configured to not allow manual job runs")]
    ManualRunsNotAllowed { def_id: String },
    #[error("cannot create job run for job def '{def_id}' because it is currently disabled")]
    JobDefDisabled { def_id: String },
    #[error("任务执行错误: {0}")]
    TaskExecution(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("操作已取消")]
    Cancelled,
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type JobsResult<T> = Result<T, JobsError>;

impl JobsError {
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }
    pub fn task_execution<S: Into<String>>(msg: S) -> Self {
        Self::TaskExecution(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn job_run_not_found<S: Into<String>>(id: S) -> Self {
        Self::JobRunNotFound { id: id.into() }
    }
    pub fn job_def_not_found<S: Into<String>>(id: S) -> Self {
        Self::JobDefNotFound { id: id.into() }
    }

    /// 乐观并发下输掉竞争，调用方应静默放弃
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, JobsError::VersionConflict { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, JobsError::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobsError::Cancelled)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JobsError::Storage(_) | JobsError::Timeout(_))
    }
}

impl From<serde_json::Error> for JobsError {
    fn from(err: serde_json::Error) -> Self {
        JobsError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for JobsError {
    fn from(err: anyhow::Error) -> Self {
        JobsError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests;
