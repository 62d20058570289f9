//! 进程内传输：endpoint -> handler 路由表
//!
//! 仍然走完整的编码 / 解码 / 校验路径，与 HTTP 行为一致；支持模拟断线与注入延迟。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use super::{dispatch, MessageHandler, Transport};
use crate::core::error::TransportError;

struct Route {
    handler: Arc<dyn MessageHandler>,
    latency: Option<Duration>,
    detached: bool,
}

#[derive(Default)]
pub struct InMemoryTransport {
    routes: RwLock<HashMap<String, Route>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 绑定 endpoint；同名 endpoint 会被替换
    pub fn bind(&self, endpoint: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        if let Ok(mut routes) = self.routes.write() {
            routes.insert(
                endpoint.into(),
                Route {
                    handler,
                    latency: None,
                    detached: false,
                },
            );
        }
    }

    pub fn unbind(&self, endpoint: &str) {
        if let Ok(mut routes) = self.routes.write() {
            routes.remove(endpoint);
        }
    }

    /// 模拟断线：之后的调用返回 Unreachable
    pub fn detach(&self, endpoint: &str) {
        self.update(endpoint, |route| route.detached = true);
    }

    pub fn attach(&self, endpoint: &str) {
        self.update(endpoint, |route| route.detached = false);
    }

    /// 每次调用前注入的固定延迟
    pub fn set_latency(&self, endpoint: &str, latency: Option<Duration>) {
        self.update(endpoint, |route| route.latency = latency);
    }

    fn update(&self, endpoint: &str, f: impl FnOnce(&mut Route)) {
        if let Ok(mut routes) = self.routes.write() {
            if let Some(route) = routes.get_mut(endpoint) {
                f(route);
            }
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, endpoint: &str, body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let (handler, latency) = {
            let routes = self
                .routes
                .read()
                .map_err(|_| TransportError::Io("route table poisoned".into()))?;
            match routes.get(endpoint) {
                Some(route) if !route.detached => (Arc::clone(&route.handler), route.latency),
                _ => return Err(TransportError::Unreachable(endpoint.to_string())),
            }
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(dispatch(handler.as_ref(), &body).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        decode, encode, Ack, Heartbeat, MessageType, ProtocolMessage, Sender,
    };

    struct AckHandler;

    #[async_trait]
    impl MessageHandler for AckHandler {
        fn league_id(&self) -> String {
            "league-1".into()
        }

        fn sender(&self) -> Sender {
            Sender::LeagueManager
        }

        async fn handle(&self, message: ProtocolMessage) -> ProtocolMessage {
            message.reply(MessageType::Ack, self.sender(), Ack::default())
        }
    }

    fn heartbeat() -> Vec<u8> {
        encode(&ProtocolMessage::new(
            MessageType::Heartbeat,
            "league-1",
            Sender::Referee("R01".into()),
            Heartbeat {
                agent_id: "R01".into(),
            },
        ))
    }

    #[tokio::test]
    async fn test_routes_to_bound_handler() {
        let transport = InMemoryTransport::new();
        transport.bind("mem://league", Arc::new(AckHandler));
        let bytes = transport.send("mem://league", heartbeat()).await.unwrap();
        assert_eq!(decode(&bytes).unwrap().message_type(), MessageType::Ack);
    }

    #[tokio::test]
    async fn test_unknown_and_detached_endpoints_unreachable() {
        let transport = InMemoryTransport::new();
        assert!(matches!(
            transport.send("mem://nobody", heartbeat()).await,
            Err(TransportError::Unreachable(_))
        ));

        transport.bind("mem://league", Arc::new(AckHandler));
        transport.detach("mem://league");
        assert!(transport.send("mem://league", heartbeat()).await.is_err());
        transport.attach("mem://league");
        assert!(transport.send("mem://league", heartbeat()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_applied() {
        let transport = InMemoryTransport::new();
        transport.bind("mem://league", Arc::new(AckHandler));
        transport.set_latency("mem://league", Some(Duration::from_secs(2)));
        let started = tokio::time::Instant::now();
        transport.send("mem://league", heartbeat()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
