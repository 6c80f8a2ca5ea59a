//! 共享定时器
//!
//! 所有重连退避、重试延迟、重新入队都走同一个定时任务：
//! 任务独占一个 `DelayQueue`，通过命令通道接收调度与取消请求。

use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, warn};

/// 到期执行的回调，在定时任务上同步运行，应当很快返回
pub type TimerJob = Box<dyn FnOnce() + Send + 'static>;

/// 定时任务句柄，用于取消
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey(u64);

enum TimerCommand {
    Schedule { id: u64, delay: Duration, job: TimerJob },
    Cancel { id: u64 },
    Shutdown,
}

pub struct TimerService {
    sender: mpsc::UnboundedSender<TimerCommand>,
    next_id: AtomicU64,
    pending: Arc<AtomicUsize>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    /// 启动定时任务，必须在 tokio 运行时内调用
    pub fn start() -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let handle = tokio::spawn(Self::run(receiver, pending.clone()));

        Arc::new(Self {
            sender,
            next_id: AtomicU64::new(1),
            pending,
            handle: Mutex::new(Some(handle)),
        })
    }

    async fn run(mut receiver: mpsc::UnboundedReceiver<TimerCommand>, pending: Arc<AtomicUsize>) {
        let mut queue: DelayQueue<u64> = DelayQueue::new();
        let mut jobs: HashMap<u64, (delay_queue::Key, TimerJob)> = HashMap::new();
        debug!("⏱️ 定时任务已启动");

        loop {
            select! {
                command = receiver.recv() => match command {
                    Some(TimerCommand::Schedule { id, delay, job }) => {
                        let key = queue.insert(id, delay);
                        jobs.insert(id, (key, job));
                    }
                    Some(TimerCommand::Cancel { id }) => {
                        if let Some((key, _)) = jobs.remove(&id) {
                            queue.remove(&key);
                        }
                    }
                    Some(TimerCommand::Shutdown) | None => break,
                },
                Some(expired) = queue.next(), if !queue.is_empty() => {
                    let id = expired.into_inner();
                    if let Some((_, job)) = jobs.remove(&id) {
                        job();
                    }
                }
            }
            pending.store(jobs.len(), Ordering::Relaxed);
        }

        pending.store(0, Ordering::Relaxed);
        info!("⏱️ 定时任务已停止，丢弃 {} 个未到期任务", jobs.len());
    }

    /// 延迟执行回调
    pub fn schedule<F>(&self, delay: Duration, job: F) -> TimerKey
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let command = TimerCommand::Schedule {
            id,
            delay,
            job: Box::new(job),
        };
        if self.sender.send(command).is_err() {
            warn!("⚠️ 定时任务已停止，忽略调度请求: id={}", id);
        }
        TimerKey(id)
    }

    /// 延迟后在运行时上执行一个 future
    pub fn schedule_async<Fut>(&self, delay: Duration, future: Fut) -> TimerKey
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.schedule(delay, move || {
            tokio::spawn(future);
        })
    }

    /// 取消未到期的任务；已执行或不存在时忽略
    pub fn cancel(&self, key: TimerKey) {
        let _ = self.sender.send(TimerCommand::Cancel { id: key.0 });
    }

    /// 未到期任务数
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// 停止定时任务
    pub async fn shutdown(&self) {
        let _ = self.sender.send(TimerCommand::Shutdown);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_schedule_fires() {
        let timer = TimerService::start();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        timer.schedule(Duration::from_millis(20), move || flag.store(true, Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(fired.load(Ordering::SeqCst));
        timer.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel() {
        let timer = TimerService::start();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let key = timer.schedule(Duration::from_millis(40), move || flag.store(true, Ordering::SeqCst));
        timer.cancel(key);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(timer.pending(), 0);
        timer.shutdown().await;
    }

    #[tokio::test]
    async fn test_ordering_and_async_jobs() {
        let timer = TimerService::start();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let late = tx.clone();
        timer.schedule_async(Duration::from_millis(60), async move {
            let _ = late.send("late");
        });
        timer.schedule(Duration::from_millis(10), move || {
            let _ = tx.send("early");
        });

        assert_eq!(rx.recv().await, Some("early"));
        assert_eq!(rx.recv().await, Some("late"));
        timer.shutdown().await;
    }
}
