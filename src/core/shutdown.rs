//! 进程关闭
//!
//! 一个根 token 派生出全部后台任务的子 token；第一次触发的原因被锁定，后续触发只会再次取消。

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 所有轮次结束
    LeagueComplete,
    /// Ctrl+C / SIGTERM
    Signal,
    FatalError(String),
}

pub struct ShutdownManager {
    root: CancellationToken,
    reason: watch::Sender<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason, _) = watch::channel(None);
        Self {
            root: CancellationToken::new(),
            reason,
        }
    }

    /// 心跳、扫描、比赛任务、HTTP 服务各持一个子 token
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// 取消所有子 token；只记录第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        let latched = self.reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });
        if latched {
            info!(reason = ?reason, "Shutting down league process");
        }
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.borrow().clone()
    }

    pub async fn wait_for_shutdown(&self) {
        self.root.cancelled().await;
    }

    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::Signal);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 跑 `app`，直到它返回或进程被要求关闭，然后执行 `cleanup`
pub async fn run_with_graceful_shutdown<F, Fut>(
    manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    manager.install_signal_handlers();

    tokio::select! {
        _ = app => info!("Node role finished"),
        _ = manager.wait_for_shutdown() => info!(reason = ?manager.reason(), "Node role interrupted"),
    }

    cleanup().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_shutdown_cancels_children() {
        let manager = ShutdownManager::new();
        let child = manager.child_token();
        assert!(!manager.is_shutdown());
        assert_eq!(manager.reason(), None);

        manager.shutdown(ShutdownReason::LeagueComplete);
        assert!(manager.is_shutdown());
        assert!(child.is_cancelled());
        // 关闭之后派生的 token 直接处于取消状态
        assert!(manager.child_token().is_cancelled());
    }

    #[test]
    fn test_first_reason_is_kept() {
        let manager = ShutdownManager::new();
        manager.shutdown(ShutdownReason::FatalError("registry lost".into()));
        manager.shutdown(ShutdownReason::LeagueComplete);
        assert_eq!(
            manager.reason(),
            Some(ShutdownReason::FatalError("registry lost".into()))
        );
    }

    #[tokio::test]
    async fn test_cleanup_runs_after_app_returns() {
        let manager = Arc::new(ShutdownManager::new());
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cleaned);
        run_with_graceful_shutdown(manager, async {}, || async move {
            flag.store(true, Ordering::SeqCst);
        })
        .await;
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_app() {
        let manager = Arc::new(ShutdownManager::new());
        manager.shutdown(ShutdownReason::Signal);
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cleaned);
        run_with_graceful_shutdown(Arc::clone(&manager), std::future::pending::<()>(), || async move {
            flag.store(true, Ordering::SeqCst);
        })
        .await;
        assert!(cleaned.load(Ordering::SeqCst));
        assert_eq!(manager.reason(), Some(ShutdownReason::Signal));
    }
}
