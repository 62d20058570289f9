//! Agent 侧心跳循环：定期向 League Manager 发送 HEARTBEAT

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::ConnectionManager;
use crate::protocol::{Heartbeat, MessageType, ProtocolMessage, Sender};

/// 启动心跳任务；失败只记录日志，下一个周期继续
pub fn spawn_heartbeat(
    connection: Arc<ConnectionManager>,
    league_endpoint: String,
    league_id: String,
    sender: Sender,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let agent_id = sender.agent_id().unwrap_or_default().to_string();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // 注册时已刷新过心跳，跳过立即触发的第一拍
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let message = ProtocolMessage::new(
                        MessageType::Heartbeat,
                        league_id.clone(),
                        sender.clone(),
                        Heartbeat { agent_id: agent_id.clone() },
                    );
                    match connection.call_expecting(&league_endpoint, &message, MessageType::Ack).await {
                        Ok(_) => debug!(agent_id = %agent_id, "Heartbeat acknowledged"),
                        Err(e) => warn!(agent_id = %agent_id, "Heartbeat failed: {}", e),
                    }
                }
            }
        }
        debug!(agent_id = %agent_id, "Heartbeat loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{BreakerConfig, RetryPolicy};
    use crate::protocol::Ack;
    use crate::transport::{InMemoryTransport, MessageHandler};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingLeague(AtomicU32);

    #[async_trait]
    impl MessageHandler for CountingLeague {
        fn league_id(&self) -> String {
            "league-1".into()
        }

        fn sender(&self) -> Sender {
            Sender::LeagueManager
        }

        async fn handle(&self, message: ProtocolMessage) -> ProtocolMessage {
            self.0.fetch_add(1, Ordering::SeqCst);
            message.reply(MessageType::Ack, self.sender(), Ack::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_sent_periodically_until_cancelled() {
        let league = Arc::new(CountingLeague(AtomicU32::new(0)));
        let transport = Arc::new(InMemoryTransport::new());
        transport.bind("mem://league", league.clone());
        let connection = Arc::new(ConnectionManager::with_policy(
            transport,
            RetryPolicy::none(),
            BreakerConfig {
                failure_threshold: 3,
                cooldown: Duration::from_secs(10),
            },
            Duration::from_secs(1),
        ));

        let token = CancellationToken::new();
        let handle = spawn_heartbeat(
            connection,
            "mem://league".into(),
            "league-1".into(),
            Sender::Player("P01".into()),
            Duration::from_secs(5),
            token.clone(),
        );

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(league.0.load(Ordering::SeqCst), 3);
        token.cancel();
        handle.await.unwrap();
    }
}
