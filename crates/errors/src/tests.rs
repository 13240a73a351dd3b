use crate::*;

#[test]
fn test_jobs_error_display() {
    let err = JobsError::JobRunNotFound {
        id: "daily_1".to_string(),
    };
    assert_eq!(err.to_string(), "job 'daily_1' no longer exists");

    let err = JobsError::HandlerRemoved {
        def_id: "daily".to_string(),
        handler_id: "reports".to_string(),
    };
    assert_eq!(
        err.to_string(),
        "job def 'daily' handler 'reports' renamed or removed"
    );

    let err = JobsError::InvalidCron {
        expr: "61 * * * *".to_string(),
        message: "out of range".to_string(),
    };
    assert_eq!(err.to_string(), "无效的CRON表达式: 61 * * * * - out of range");

    assert_eq!(JobsError::Cancelled.to_string(), "操作已取消");
}

#[test]
fn test_version_conflict_classification() {
    let conflict = JobsError::VersionConflict {
        kind: "job_task",
        id: "t1".to_string(),
        expected: 3,
    };
    assert!(conflict.is_version_conflict());
    assert!(!conflict.is_retryable());
    assert!(!JobsError::storage("down").is_version_conflict());
}

#[test]
fn test_retryable_errors() {
    assert!(JobsError::storage("connection reset").is_retryable());
    assert!(JobsError::Timeout("task".to_string()).is_retryable());
    assert!(!JobsError::task_execution("boom").is_retryable());
    assert!(!JobsError::Cancelled.is_retryable());
}

#[test]
fn test_from_serde_json_error() {
    let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let err: JobsError = parse_err.into();
    assert!(matches!(err, JobsError::Serialization(_)));
}

#[test]
fn test_from_anyhow_error() {
    let err: JobsError = anyhow::anyhow!("wrapped").into();
    assert_eq!(err, JobsError::Internal("wrapped".to_string()));
}
