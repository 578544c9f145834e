//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了逻辑过期策略的后台重建工作池。

use crate::error::{FlashError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

type RebuildJob = BoxFuture<'static, ()>;

/// 重建工作池
///
/// 固定数量的工作任务共享一个有界队列。队列满时提交失败，由调用方直接返回旧值。
pub struct RebuildPool {
    sender: Mutex<Option<mpsc::Sender<RebuildJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for RebuildPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebuildPool").finish_non_exhaustive()
    }
}

impl RebuildPool {
    /// 启动工作池，必须在tokio运行时内调用
    pub fn new(workers: usize, queue_size: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<RebuildJob>(queue_size.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { receiver.lock().await.recv().await };
                        let Some(job) = job else {
                            break;
                        };
                        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                            error!("Rebuild job panicked on worker {}", worker_id);
                        }
                    }
                    debug!("Rebuild worker {} stopped", worker_id);
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
        }
    }

    /// 提交重建任务，不等待执行
    pub async fn submit<F>(&self, job: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let guard = self.sender.lock().await;
        let Some(sender) = guard.as_ref() else {
            return Err(FlashError::Shutdown(
                "rebuild pool is shut down".to_string(),
            ));
        };
        sender.try_send(job.boxed()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                FlashError::QueueFull("rebuild queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                FlashError::Shutdown("rebuild pool is shut down".to_string())
            }
        })
    }

    /// 关闭队列并等待已排队的任务执行完毕
    pub async fn shutdown(&self) {
        self.sender.lock().await.take();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Rebuild worker join failed: {}", e);
            }
        }
        info!("Rebuild pool shut down");
    }
}
