//! # Channel
//!
//! Measurement Channel between nodes and the controller.
//!
//! 负责：
//! - Topic 语法 `<prefix>/<kind>/<device_id|all>`
//! - 封闭的消息类型与 JSON 编解码
//! - 按 topic 区分的投递保证 (at-least-once / at-most-once)
//! - Fan-out 到各节点链路，隔离慢节点

pub mod dispatcher;
pub mod error;
pub mod link;
pub mod links;
pub mod message;
pub mod metrics;
pub mod topic;
pub mod uplink;

pub use dispatcher::{create_dispatcher, Dispatcher, DispatcherBuilder};
pub use error::{LinkError, ProtocolError};
pub use link::{LinkHandle, NodeLink, RetryPolicy};
pub use links::{LocalLink, LogLink};
pub use message::{CommandPayload, DriftReport, Envelope, Heartbeat, Message, StatusReport};
pub use metrics::{LinkMetrics, MetricsSnapshot};
pub use topic::{Delivery, Target, Topic, TopicKind};
pub use uplink::Uplink;
