//! 事件系统模块
//!
//! 功能包括：
//! - 观察者注册表：显式 add/remove，每个观察者声明自己的分发方式
//! - 主线程上下文：标记为 `DispatchMode::Main` 的回调被投递到宿主的 UI/主循环执行
//! - 发送状态事件

use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::message::MessageStatus;

/// 回调分发方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchMode {
    /// 在产生事件的处理线程上直接调用
    Inline,
    /// 投递到主线程上下文执行
    Main,
}

type MainJob = Box<dyn FnOnce() + Send + 'static>;

/// 主线程上下文
///
/// 宿主在自己的 UI/主循环里周期性调用 [`MainContext::run_pending`]，
/// 或者用 [`MainContext::spawn_runner`] 交给一个专门的任务执行。
pub struct MainContext {
    sender: mpsc::UnboundedSender<MainJob>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<MainJob>>>,
}

impl MainContext {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// 投递一个任务
    pub fn post<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.sender.send(Box::new(job)).is_err() {
            warn!("⚠️ 主线程上下文已关闭，丢弃回调");
        }
    }

    /// 执行当前积压的全部任务，返回执行数量
    ///
    /// 已经交给 runner 任务时返回 0。
    pub fn run_pending(&self) -> usize {
        let mut guard = self.receiver.lock();
        let receiver = match guard.as_mut() {
            Some(receiver) => receiver,
            None => return 0,
        };
        let mut count = 0;
        while let Ok(job) = receiver.try_recv() {
            run_guarded(job);
            count += 1;
        }
        count
    }

    /// 在一个专门的任务上持续执行投递的回调
    pub fn spawn_runner(&self) -> Option<JoinHandle<()>> {
        let mut receiver = self.receiver.lock().take()?;
        Some(tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                run_guarded(job);
            }
            debug!("主线程上下文 runner 退出");
        }))
    }
}

fn run_guarded<F: FnOnce()>(job: F) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("❌ 观察者回调 panic，已忽略");
    }
}

/// 观察者 id，用于移除
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync + 'static>;

struct ObserverEntry<E> {
    id: ObserverId,
    mode: DispatchMode,
    callback: Callback<E>,
}

/// 观察者注册表
pub struct ObserverRegistry<E> {
    observers: RwLock<Vec<ObserverEntry<E>>>,
    next_id: AtomicU64,
    main: Arc<MainContext>,
}

impl<E> ObserverRegistry<E>
where
    E: Clone + Send + Sync + 'static,
{
    pub fn new(main: Arc<MainContext>) -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            main,
        }
    }

    /// 注册观察者
    pub fn add<F>(&self, mode: DispatchMode, callback: F) -> ObserverId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push(ObserverEntry {
            id,
            mode,
            callback: Arc::new(callback),
        });
        id
    }

    /// 移除观察者，返回是否存在
    pub fn remove(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|entry| entry.id != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    /// 分发事件，按观察者各自的方式调用
    pub fn dispatch(&self, event: &E) {
        // 先复制一份列表，回调里可以安全地增删观察者
        let snapshot: Vec<(DispatchMode, Callback<E>)> = self
            .observers
            .read()
            .iter()
            .map(|entry| (entry.mode, entry.callback.clone()))
            .collect();

        for (mode, callback) in snapshot {
            match mode {
                DispatchMode::Inline => run_guarded(|| callback(event)),
                DispatchMode::Main => {
                    let event = event.clone();
                    self.main.post(move || callback(&event));
                }
            }
        }
    }
}

/// 发送过程中的事件
#[derive(Debug, Clone, PartialEq)]
pub enum SendEvent {
    /// 状态变化
    StatusChanged {
        message_id: String,
        status: MessageStatus,
    },
    /// 附件上传进度（0-100）
    UploadProgress { message_id: String, progress: u8 },
    /// broker 已确认
    SendSucceeded { message_id: String },
    /// 终态失败
    SendFailed {
        message_id: String,
        code: i32,
        reason: String,
    },
    /// 已取消
    SendCanceled { message_id: String },
}

impl SendEvent {
    pub fn message_id(&self) -> &str {
        match self {
            SendEvent::StatusChanged { message_id, .. }
            | SendEvent::UploadProgress { message_id, .. }
            | SendEvent::SendSucceeded { message_id }
            | SendEvent::SendFailed { message_id, .. }
            | SendEvent::SendCanceled { message_id } => message_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            SendEvent::StatusChanged { .. } => "status_changed",
            SendEvent::UploadProgress { .. } => "upload_progress",
            SendEvent::SendSucceeded { .. } => "send_succeeded",
            SendEvent::SendFailed { .. } => "send_failed",
            SendEvent::SendCanceled { .. } => "send_canceled",
        }
    }
}

pub type SendListenerRegistry = ObserverRegistry<SendEvent>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_inline_dispatch_and_remove() {
        let registry: ObserverRegistry<u32> = ObserverRegistry::new(MainContext::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let id = registry.add(DispatchMode::Inline, move |value: &u32| {
            counter.fetch_add(*value as usize, Ordering::SeqCst);
        });
        registry.dispatch(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        registry.dispatch(&5);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_main_dispatch_waits_for_pump() {
        let main = MainContext::new();
        let registry: ObserverRegistry<String> = ObserverRegistry::new(main.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        registry.add(DispatchMode::Main, move |value: &String| sink.lock().push(value.clone()));
        registry.dispatch(&"hello".to_string());

        // 主线程还没执行
        assert!(seen.lock().is_empty());
        assert_eq!(main.run_pending(), 1);
        assert_eq!(*seen.lock(), vec!["hello".to_string()]);
    }

    #[test]
    fn test_panicking_observer_does_not_stop_others() {
        let registry: ObserverRegistry<u32> = ObserverRegistry::new(MainContext::new());
        let hits = Arc::new(AtomicUsize::new(0));

        registry.add(DispatchMode::Inline, |_: &u32| panic!("observer bug"));
        let counter = hits.clone();
        registry.add(DispatchMode::Inline, move |_: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.dispatch(&1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_main_runner() {
        let main = MainContext::new();
        let handle = main.spawn_runner().unwrap();
        assert!(main.spawn_runner().is_none());

        let (tx, mut rx) = mpsc::unbounded_channel();
        main.post(move || {
            let _ = tx.send(42);
        });
        assert_eq!(rx.recv().await, Some(42));
        handle.abort();
    }

    #[test]
    fn test_send_event_accessors() {
        let event = SendEvent::SendFailed {
            message_id: "m1".to_string(),
            code: 2000,
            reason: "upload".to_string(),
        };
        assert_eq!(event.message_id(), "m1");
        assert_eq!(event.event_type(), "send_failed");
    }
}
