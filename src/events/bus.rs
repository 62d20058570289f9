//! 进程内发布/订阅
//!
//! - `publish` 只把事件放入队列，不等待 handler 执行
//! - 单个分发任务按发布顺序处理事件；同一事件的 handler 按订阅顺序逐个执行，
//!   每个 handler 在独立任务中运行，报错或 panic 只记录日志，不影响其它 handler 与发布方
//! - 保留有界历史供晚到的订阅者取快照；尽力而为，不做持久化

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use super::event::Event;

pub type SubscriptionId = u64;

/// 事件处理器
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// 闭包适配器
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

/// 用异步闭包构造 handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct Subscription {
    pattern: String,
    handler: Arc<dyn EventHandler>,
}

enum Command {
    Dispatch(Event),
    Flush(oneshot::Sender<()>),
}

struct Inner {
    /// 订阅 id 单调递增，BTreeMap 的顺序即订阅顺序
    subscriptions: RwLock<BTreeMap<SubscriptionId, Subscription>>,
    history: Mutex<VecDeque<Event>>,
    capacity: usize,
    next_id: AtomicU64,
}

/// 可克隆句柄；所有克隆共享同一分发任务
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
    tx: mpsc::UnboundedSender<Command>,
}

impl EventBus {
    /// 创建并启动分发任务（需要在 tokio 运行时内调用）
    pub fn new(history_capacity: usize) -> Self {
        let inner = Arc::new(Inner {
            subscriptions: RwLock::new(BTreeMap::new()),
            history: Mutex::new(VecDeque::with_capacity(history_capacity.min(1024))),
            capacity: history_capacity,
            next_id: AtomicU64::new(1),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_dispatcher(Arc::clone(&inner), rx));
        Self { inner, tx }
    }

    /// 发布事件：写入历史并排队分发，立即返回
    pub fn publish(&self, event: Event) {
        if self.inner.capacity > 0 {
            if let Ok(mut history) = self.inner.history.lock() {
                if history.len() >= self.inner.capacity {
                    history.pop_front();
                }
                history.push_back(event.clone());
            }
        }
        if self.tx.send(Command::Dispatch(event)).is_err() {
            warn!("Event dispatcher stopped, event dropped");
        }
    }

    /// 订阅事件类型（`*` 为全部，`match.*` 为前缀）
    pub fn subscribe(&self, pattern: impl Into<String>, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let pattern = pattern.into();
        debug!(id, pattern = %pattern, "Event subscription added");
        if let Ok(mut subs) = self.inner.subscriptions.write() {
            subs.insert(id, Subscription { pattern, handler });
        }
        id
    }

    /// 取消订阅；返回该订阅是否存在
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner
            .subscriptions
            .write()
            .map(|mut subs| subs.remove(&id).is_some())
            .unwrap_or(false)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.read().map(|s| s.len()).unwrap_or(0)
    }

    /// 历史快照（旧 -> 新）
    pub fn history(&self) -> Vec<Event> {
        self.inner
            .history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 按模式过滤的历史快照
    pub fn history_matching(&self, pattern: &str) -> Vec<Event> {
        self.history().into_iter().filter(|e| e.matches(pattern)).collect()
    }

    /// 等待调用前已发布的事件全部分发完毕
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run_dispatcher(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Dispatch(event) => dispatch(&inner, event).await,
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Event dispatcher exited");
}

async fn dispatch(inner: &Inner, event: Event) {
    let handlers: Vec<(SubscriptionId, Arc<dyn EventHandler>)> = match inner.subscriptions.read() {
        Ok(subs) => subs
            .iter()
            .filter(|(_, s)| event.matches(&s.pattern))
            .map(|(id, s)| (*id, Arc::clone(&s.handler)))
            .collect(),
        Err(_) => return,
    };
    let event = Arc::new(event);

    for (id, handler) in handlers {
        let ev = Arc::clone(&event);
        let task = tokio::spawn(async move { handler.handle(&ev).await });
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(subscription = id, event_type = %event.event_type, "Event handler failed: {}", e),
            Err(e) => error!(subscription = id, event_type = %event.event_type, "Event handler panicked: {}", e),
        }
    }
}
