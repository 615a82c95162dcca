//! 同步指标收集模块
//!
//! `metrics` facade 记录 + 内存聚合（运行结束时输出摘要）。

use std::collections::BTreeMap;

use contracts::{DeviceStatus, DriftSample, GroupQuality, OffsetCommand};
use metrics::{counter, gauge, histogram};

/// 记录一次漂移测量（控制器侧）
pub fn record_drift_sample(sample: &DriftSample) {
    let result = match sample.rejection {
        None => "valid",
        Some(reason) => reason.as_str(),
    };
    counter!(
        "syncstream_drift_samples_total",
        "device_id" => sample.device_id.to_string(),
        "result" => result
    )
    .increment(1);

    histogram!("syncstream_correlation_score").record(sample.correlation_score);
    if sample.valid {
        gauge!(
            "syncstream_raw_drift_ms",
            "device_id" => sample.device_id.to_string()
        )
        .set(sample.raw_drift_ms);
    }
}

/// 记录被剔除的离群样本
pub fn record_outlier(device_id: &str) {
    counter!(
        "syncstream_drift_outliers_total",
        "device_id" => device_id.to_string()
    )
    .increment(1);
}

/// 记录平滑后的漂移
pub fn record_ema(device_id: &str, ema_ms: f64) {
    gauge!("syncstream_ema_drift_ms", "device_id" => device_id.to_string()).set(ema_ms);
}

/// 记录下发的偏移命令
pub fn record_offset_command(command: &OffsetCommand, step_ms: f64) {
    counter!(
        "syncstream_offset_commands_total",
        "reason" => command.reason.as_str()
    )
    .increment(1);
    gauge!(
        "syncstream_current_offset_ms",
        "device_id" => command.device_id.to_string()
    )
    .set(command.new_offset_ms);
    histogram!("syncstream_offset_step_ms").record(step_ms.abs());
}

/// 记录设备状态迁移
pub fn record_status_transition(device_id: &str, from: DeviceStatus, to: DeviceStatus) {
    counter!(
        "syncstream_status_transitions_total",
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
    tracing::debug!(
        device_id,
        from = from.as_str(),
        to = to.as_str(),
        "Device status transition"
    );
}

/// 记录组对齐质量
pub fn record_group_quality(group_id: &str, spread_ms: f64, quality: GroupQuality) {
    gauge!("syncstream_group_spread_ms", "group_id" => group_id.to_string()).set(spread_ms);
    gauge!("syncstream_group_quality", "group_id" => group_id.to_string())
        .set(f64::from(quality.level()));
}

/// 记录设备数量
pub fn record_device_counts(total: usize, online: usize) {
    gauge!("syncstream_devices").set(total as f64);
    gauge!("syncstream_devices_online").set(online as f64);
}

/// 记录无法解析的入站消息
pub fn record_decode_failure(reason: &'static str) {
    counter!("syncstream_decode_failures_total", "reason" => reason).increment(1);
}

/// 同步指标聚合器
///
/// 在内存中聚合指标，便于统计和输出摘要。
#[derive(Debug, Clone, Default)]
pub struct SyncMetricsAggregator {
    /// 收到的样本总数
    pub total_samples: u64,

    /// 有效样本数
    pub valid_samples: u64,

    /// 按原因统计的拒绝数
    pub rejections: BTreeMap<&'static str, u64>,

    /// 离群样本数
    pub outliers: u64,

    /// 重复投递被忽略的样本数
    pub duplicates: u64,

    /// 按原因统计的偏移命令
    pub commands: BTreeMap<&'static str, u64>,

    /// 状态迁移次数
    pub transitions: u64,

    /// 解析失败的入站消息
    pub decode_failures: u64,

    /// |漂移| 统计 (ms)
    pub drift_stats: RunningStats,

    /// 相关性得分统计
    pub score_stats: RunningStats,

    /// 单步偏移幅度统计 (ms)
    pub step_stats: RunningStats,
}

impl SyncMetricsAggregator {
    /// 创建新的聚合器
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_sample(&mut self, sample: &DriftSample) {
        self.total_samples += 1;
        self.score_stats.push(sample.correlation_score);
        match sample.rejection {
            None => {
                self.valid_samples += 1;
                self.drift_stats.push(sample.raw_drift_ms.abs());
            }
            Some(reason) => *self.rejections.entry(reason.as_str()).or_insert(0) += 1,
        }
    }

    pub fn update_outlier(&mut self) {
        self.outliers += 1;
    }

    pub fn update_duplicate(&mut self) {
        self.duplicates += 1;
    }

    pub fn update_command(&mut self, command: &OffsetCommand, step_ms: f64) {
        *self.commands.entry(command.reason.as_str()).or_insert(0) += 1;
        self.step_stats.push(step_ms.abs());
    }

    pub fn update_transition(&mut self) {
        self.transitions += 1;
    }

    pub fn update_decode_failure(&mut self) {
        self.decode_failures += 1;
    }

    /// 生成摘要报告
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            total_samples: self.total_samples,
            valid_samples: self.valid_samples,
            valid_rate: if self.total_samples > 0 {
                self.valid_samples as f64 / self.total_samples as f64 * 100.0
            } else {
                0.0
            },
            rejections: self.rejections.clone(),
            outliers: self.outliers,
            duplicates: self.duplicates,
            commands: self.commands.clone(),
            transitions: self.transitions,
            decode_failures: self.decode_failures,
            abs_drift_ms: StatsSummary::from(&self.drift_stats),
            correlation: StatsSummary::from(&self.score_stats),
            step_ms: StatsSummary::from(&self.step_stats),
        }
    }

    /// 重置统计
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// 指标摘要
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    pub total_samples: u64,
    pub valid_samples: u64,
    pub valid_rate: f64,
    pub rejections: BTreeMap<&'static str, u64>,
    pub outliers: u64,
    pub duplicates: u64,
    pub commands: BTreeMap<&'static str, u64>,
    pub transitions: u64,
    pub decode_failures: u64,
    pub abs_drift_ms: StatsSummary,
    pub correlation: StatsSummary,
    pub step_ms: StatsSummary,
}

impl MetricsSummary {
    pub fn total_commands(&self) -> u64 {
        self.commands.values().sum()
    }
}

impl std::fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Sync Metrics Summary ===")?;
        writeln!(
            f,
            "Drift samples: {} ({} valid, {:.2}%)",
            self.total_samples, self.valid_samples, self.valid_rate
        )?;
        for (reason, count) in &self.rejections {
            writeln!(f, "  rejected {}: {}", reason, count)?;
        }
        writeln!(f, "Outliers: {}", self.outliers)?;
        writeln!(f, "Duplicates ignored: {}", self.duplicates)?;
        writeln!(f, "Offset commands: {}", self.total_commands())?;
        for (reason, count) in &self.commands {
            writeln!(f, "  {}: {}", reason, count)?;
        }
        writeln!(f, "Status transitions: {}", self.transitions)?;
        writeln!(f, "Decode failures: {}", self.decode_failures)?;
        writeln!(f, "|Drift| (ms): {}", self.abs_drift_ms)?;
        writeln!(f, "Correlation: {}", self.correlation)?;
        writeln!(f, "Step (ms): {}", self.step_ms)?;
        Ok(())
    }
}

/// 统计摘要
#[derive(Debug, Clone, Default)]
pub struct StatsSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl From<&RunningStats> for StatsSummary {
    fn from(stats: &RunningStats) -> Self {
        Self {
            count: stats.count,
            min: stats.min,
            max: stats.max,
            mean: stats.mean(),
            std_dev: stats.std_dev(),
        }
    }
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            write!(f, "N/A")
        } else {
            write!(
                f,
                "min={:.3}, max={:.3}, mean={:.3}, std={:.3} (n={})",
                self.min, self.max, self.mean, self.std_dev, self.count
            )
        }
    }
}

/// 在线统计计算器 (Welford's algorithm)
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    /// 添加新值
    pub fn push(&mut self, value: f64) {
        self.count += 1;

        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.mean = value;
            self.m2 = 0.0;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);

            let delta = value - self.mean;
            self.mean += delta / self.count as f64;
            let delta2 = value - self.mean;
            self.m2 += delta * delta2;
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// 样本方差
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}
