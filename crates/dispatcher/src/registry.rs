use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use jobs_core::{JobsError, JobsResult};
use tracing::debug;

use crate::handler::{check_payload_types, DynHandler, Handler, TypedHandler};

type HandlerCtor = Arc<dyn Fn() -> Arc<dyn DynHandler> + Send + Sync>;

/// 作业类型注册表，由引擎持有
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerCtor>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.ids())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器，`id` 缺省为处理器的类型名；返回实际使用的标识
    pub fn register<H, F>(&mut self, id: Option<&str>, ctor: F) -> JobsResult<String>
    where
        H: Handler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let id = match id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => std::any::type_name::<H>().to_string(),
        };
        if self.handlers.contains_key(&id) {
            return Err(JobsError::HandlerAlreadyRegistered(id));
        }
        check_payload_types::<H>()?;

        debug!("注册作业类型处理器: {id}");
        self.handlers.insert(
            id.clone(),
            Arc::new(move || Arc::new(TypedHandler::new(ctor())) as Arc<dyn DynHandler>),
        );
        Ok(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.handlers.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// 每次调用都构造新的处理器实例
    pub fn create(&self, id: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(id).map(|ctor| ctor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{FinalTaskQuery, JobContext, TaskEmitter};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Empty {}

    struct NoopHandler;

    #[async_trait]
    impl Handler for NoopHandler {
        type JobDetails = Empty;
        type JobResults = Empty;
        type TaskDetails = Empty;
        type TaskResults = Empty;

        async fn task_details(
            &self,
            _ctx: &JobContext<Empty>,
            _emitter: &mut TaskEmitter<Empty>,
        ) -> JobsResult<Option<FinalTaskQuery>> {
            Ok(None)
        }

        async fn task_results(&self, _ctx: &JobContext<Empty>, _details: Empty) -> JobsResult<Empty> {
            Ok(Empty {})
        }
    }

    /// 任务结果是数字而不是对象
    struct ScalarHandler;

    #[async_trait]
    impl Handler for ScalarHandler {
        type JobDetails = Empty;
        type JobResults = Empty;
        type TaskDetails = Empty;
        type TaskResults = u32;

        async fn task_details(
            &self,
            _ctx: &JobContext<Empty>,
            _emitter: &mut TaskEmitter<Empty>,
        ) -> JobsResult<Option<FinalTaskQuery>> {
            Ok(None)
        }

        async fn task_results(&self, _ctx: &JobContext<Empty>, _details: Empty) -> JobsResult<u32> {
            Ok(1)
        }
    }

    #[test]
    fn test_register_defaults_id_to_type_name() {
        let mut registry = HandlerRegistry::new();
        let id = registry.register(None, || NoopHandler).unwrap();
        assert!(id.ends_with("NoopHandler"));
        assert!(registry.contains(&id));
        assert!(registry.create(&id).is_some());
        assert!(registry.create("unknown").is_none());
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = HandlerRegistry::new();
        registry.register(Some("noop"), || NoopHandler).unwrap();
        let err = registry.register(Some("noop"), || NoopHandler).unwrap_err();
        assert_eq!(err, JobsError::HandlerAlreadyRegistered("noop".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_rejects_non_object_payloads() {
        let mut registry = HandlerRegistry::new();
        let err = registry.register(Some("scalar"), || ScalarHandler).unwrap_err();
        assert!(matches!(err, JobsError::InvalidHandlerPayload(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_separate_registries_do_not_share_state() {
        let mut a = HandlerRegistry::new();
        let b = HandlerRegistry::new();
        a.register(Some("noop"), || NoopHandler).unwrap();
        assert!(a.contains("noop"));
        assert!(!b.contains("noop"));
    }
}
