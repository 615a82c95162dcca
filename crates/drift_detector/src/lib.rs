//! # Drift Detector
//!
//! 节点侧漂移测量。
//!
//! ## 功能
//!
//! - 信号预处理：零相位高通、RMS 归一化、边缘窗
//! - FFT 互相关，有界滞后范围，峰值显著性校验
//! - NodeAgent：自适应测量间隔、忙时跳过、心跳与状态上报、应用缓冲偏移
//! - 模拟声学环境（测试与 `simulate` 命令）
//!
//! Drift is reported as the node's intrinsic drift: the lag heard through
//! the microphone with the node's applied correction removed.

pub mod agent;
pub mod correlation;
pub mod detector;
pub mod error;
pub mod mock;
pub mod preprocess;

pub use agent::{AgentStats, Cadence, NodeAgent, NodeAudio, OffsetLog};
pub use correlation::{correlate, CorrelationPeak};
pub use detector::DriftDetector;
pub use error::DetectorError;
pub use mock::{
    DriftModel, ReferenceSource, SharedOffset, SimulatedAcoustics, SimulatedCapture, ToneLog,
};
pub use preprocess::{Biquad, SignalPreprocessor};
