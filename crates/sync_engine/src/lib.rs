//! # Sync Engine
//!
//! 中心同步引擎：设备注册表 + 偏移控制器。
//!
//! 负责：
//! - 设备生命周期状态机 (Registering / Online / Degraded / Offline)
//! - EMA 平滑、离群剔除、反应式与预测式偏移修正
//! - 同步组对齐 (spread / quality)
//! - 单任务 actor：入站消息、定时巡检、控制请求串行处理
//!
//! ## 使用示例
//!
//! ```ignore
//! use sync_engine::{ResyncScope, SyncEngine};
//!
//! let (uplink, inbound_rx) = channel::Uplink::channel(&config.channel);
//! let (outbound_tx, dispatcher) = channel::create_dispatcher(&config.channel);
//!
//! let (engine, handle) = SyncEngine::new(&config, inbound_rx, outbound_tx)?;
//! let task = engine.spawn();
//!
//! handle.resync(ResyncScope::All).await?;
//! let snapshots = handle.snapshots().await?;
//! ```

mod controller;
mod engine;
mod error;
mod history;
mod registry;
mod sync_core;
mod trend;

pub use controller::{Correction, Decision, GroupAlignment, Prediction, SyncController};
pub use engine::{EngineHandle, SyncEngine, SyncReport};
pub use error::{EngineError, RegistryError};
pub use history::{DriftStats, SampleHistory};
pub use registry::{
    DeviceRegistry, DeviceState, RegisterOutcome, SampleOutcome, StatusChange, SweepReport,
};
pub use sync_core::{ResyncScope, SyncCore, SyncStatus};
pub use trend::{fit as fit_trend, Trend};

// Re-export contracts types
pub use contracts::{ControllerConfig, DeviceSnapshot, OffsetCommand, RegistryConfig, SyncGroup};
