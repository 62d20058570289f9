//! 落子收件箱：接收玩家异步推送的 MOVE_RESULT
//!
//! 每个 (match_id, player_id) 同一时刻至多一个打开的窗口；窗口随 `MoveWindow` drop 关闭，
//! 之后到达的落子一律视为迟到。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::game::{Game, Move};
use crate::protocol::MoveResult;

/// 推送落子被拒绝的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushRejection {
    /// 没有对应的打开窗口（期限已过或小局不匹配）
    Late,
    /// 游戏规则不接受，窗口仍然打开，可重新提交
    Invalid(String),
}

struct Slot {
    id: u64,
    game_round: u32,
    game: Arc<dyn Game>,
    tx: mpsc::UnboundedSender<Move>,
}

#[derive(Default)]
pub struct MoveInbox {
    windows: Mutex<HashMap<(String, String), Slot>>,
    next_id: AtomicU64,
}

impl MoveInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为某个玩家的某一小局打开窗口
    pub fn open(
        self: &Arc<Self>,
        match_id: &str,
        player_id: &str,
        game_round: u32,
        game: Arc<dyn Game>,
    ) -> MoveWindow {
        let (tx, rx) = mpsc::unbounded_channel();
        let key = (match_id.to_string(), player_id.to_string());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut windows) = self.windows.lock() {
            windows.insert(
                key.clone(),
                Slot {
                    id,
                    game_round,
                    game,
                    tx,
                },
            );
        }
        MoveWindow {
            inbox: Arc::clone(self),
            key,
            id,
            rx,
        }
    }

    /// 投递一个推送的落子
    pub fn push(&self, mv: &MoveResult) -> Result<(), PushRejection> {
        let windows = self.windows.lock().map_err(|_| PushRejection::Late)?;
        let key = (mv.match_id.clone(), mv.player_id.clone());
        let slot = match windows.get(&key) {
            Some(slot) if slot.game_round == mv.game_round => slot,
            _ => {
                warn!(
                    match_id = %mv.match_id,
                    player_id = %mv.player_id,
                    game_round = mv.game_round,
                    "Late move rejected"
                );
                return Err(PushRejection::Late);
            }
        };
        if !slot.game.validate(&mv.value) {
            return Err(PushRejection::Invalid(format!(
                "{} is not a legal {} move",
                mv.value,
                slot.game.name()
            )));
        }
        slot.tx.send(mv.value.clone()).map_err(|_| PushRejection::Late)?;
        debug!(match_id = %mv.match_id, player_id = %mv.player_id, "Pushed move accepted");
        Ok(())
    }

    pub fn open_windows(&self) -> usize {
        self.windows.lock().map(|w| w.len()).unwrap_or(0)
    }

    /// 只关闭自己打开的那个窗口（同一玩家的新窗口可能已经替换了它）
    fn close(&self, key: &(String, String), id: u64) {
        if let Ok(mut windows) = self.windows.lock() {
            if windows.get(key).is_some_and(|slot| slot.id == id) {
                windows.remove(key);
            }
        }
    }
}

/// 打开的落子窗口；drop 即关闭
pub struct MoveWindow {
    inbox: Arc<MoveInbox>,
    key: (String, String),
    id: u64,
    rx: mpsc::UnboundedReceiver<Move>,
}

impl MoveWindow {
    pub async fn recv(&mut self) -> Option<Move> {
        self.rx.recv().await
    }
}

impl Drop for MoveWindow {
    fn drop(&mut self) {
        self.inbox.close(&self.key, self.id);
    }
}
