//! 有界并发的批量执行工具
//!
//! 引擎内所有"对一批资源逐个做同一件事"的地方都经过这里，用来限制同时进行的
//! 存储调用和处理器调用数量。

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, warn};

/// 条目自带的超时时间
pub trait ItemTimeout {
    fn item_timeout(&self) -> Option<Duration>;
}

/// 一次批量执行的结果统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GoItemsReport {
    pub completed: usize,
    pub timed_out: usize,
    pub panicked: usize,
}

impl GoItemsReport {
    pub fn total(&self) -> usize {
        self.completed + self.timed_out + self.panicked
    }
}

/// 对每个条目执行一次 `op`，阻塞直到全部结束。
///
/// - `max_concurrency == 1` 或只有一个条目时，在调用方任务中顺序执行
/// - `max_concurrency == 0` 表示不限并发
/// - 其他值通过信号量限制同时进行的操作数
///
/// `timeout` 对每个条目单独生效，超时的条目被放弃。
pub async fn go_items<T, F, Fut>(
    items: Vec<T>,
    max_concurrency: usize,
    timeout: Option<Duration>,
    op: F,
) -> GoItemsReport
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    run_items(items, max_concurrency, move |_: &T| timeout, op).await
}

/// 同 [`go_items`]，但未显式给出 `timeout_override` 时使用每个条目自己的超时
pub async fn go_timed_items<T, F, Fut>(
    items: Vec<T>,
    max_concurrency: usize,
    timeout_override: Option<Duration>,
    op: F,
) -> GoItemsReport
where
    T: ItemTimeout + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    run_items(
        items,
        max_concurrency,
        move |item: &T| timeout_override.or_else(|| item.item_timeout()),
        op,
    )
    .await
}

async fn run_items<T, F, Fut, D>(
    items: Vec<T>,
    max_concurrency: usize,
    timeout_of: D,
    op: F,
) -> GoItemsReport
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
    D: Fn(&T) -> Option<Duration>,
{
    let mut report = GoItemsReport::default();
    if items.is_empty() {
        return report;
    }

    if max_concurrency == 1 || items.len() == 1 {
        for item in items {
            let timeout = timeout_of(&item);
            match AssertUnwindSafe(run_one(timeout, op(item)))
                .catch_unwind()
                .await
            {
                Ok(true) => report.completed += 1,
                Ok(false) => report.timed_out += 1,
                Err(_) => {
                    error!("批量操作中的条目发生panic");
                    report.panicked += 1;
                }
            }
        }
        return report;
    }

    let op = Arc::new(op);
    let semaphore = (max_concurrency > 0).then(|| Arc::new(Semaphore::new(max_concurrency)));
    let mut join_set = JoinSet::new();
    for item in items {
        let timeout = timeout_of(&item);
        let permit = match &semaphore {
            Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
            None => None,
        };
        let op = Arc::clone(&op);
        join_set.spawn(async move {
            let _permit = permit;
            run_one(timeout, op(item)).await
        });
    }

    while let Some(result) = join_set.join_next().await {
        match result {
            Ok(true) => report.completed += 1,
            Ok(false) => report.timed_out += 1,
            Err(e) if e.is_panic() => {
                error!("批量操作中的条目发生panic: {e}");
                report.panicked += 1;
            }
            Err(e) => {
                warn!("批量操作中的条目被中止: {e}");
                report.panicked += 1;
            }
        }
    }
    if report.timed_out > 0 {
        warn!(
            timed_out = report.timed_out,
            total = report.total(),
            "批量操作中有条目超时"
        );
    }
    report
}

async fn run_one<Fut: Future<Output = ()>>(timeout: Option<Duration>, fut: Fut) -> bool {
    match timeout {
        Some(duration) => tokio::time::timeout(duration, fut).await.is_ok(),
        None => {
            fut.await;
            true
        }
    }
}
