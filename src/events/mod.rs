//! 事件总线：把联赛 / 比赛状态迁移推送给观察者

mod bus;
mod event;

pub use bus::{handler_fn, EventBus, EventHandler, FnHandler, SubscriptionId};
pub use event::{types, Event};
