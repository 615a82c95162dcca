//! 配置校验模块
//!
//! 校验规则：
//! - device_id 唯一且可作为 topic 段
//! - group_id 唯一
//! - 数值参数在合法范围内
//! - 区间上下界顺序正确 (base <= max, settle <= tolerance, excellent <= good <= fair)

use std::collections::HashSet;

use contracts::{is_valid_segment, ContractError, SyncStreamConfig, DEFAULT_GROUP};

/// Lowest supported capture rate is 16 kHz
const MAX_HIGHPASS_CUTOFF_HZ: f64 = 8_000.0;

/// 校验 SyncStreamConfig
///
/// 返回第一个遇到的错误，或 Ok(())。
pub fn validate(config: &SyncStreamConfig) -> Result<(), ContractError> {
    validate_devices(config)?;
    validate_groups(config)?;
    validate_preprocess(config)?;
    validate_detector(config)?;
    validate_sampling(config)?;
    validate_controller(config)?;
    validate_registry(config)?;
    validate_channel(config)?;
    Ok(())
}

fn positive(field: &str, value: f64) -> Result<(), ContractError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ContractError::config_validation(
            field,
            format!("must be > 0, got {value}"),
        ))
    }
}

fn non_negative(field: &str, value: f64) -> Result<(), ContractError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ContractError::config_validation(
            field,
            format!("must be >= 0, got {value}"),
        ))
    }
}

fn in_unit_interval(field: &str, value: f64) -> Result<(), ContractError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ContractError::config_validation(
            field,
            format!("must be within [0, 1], got {value}"),
        ))
    }
}

/// 校验设备 id 唯一性和合法性
fn validate_devices(config: &SyncStreamConfig) -> Result<(), ContractError> {
    let mut seen = HashSet::new();
    for device in &config.devices {
        if !is_valid_segment(&device.device_id) {
            return Err(ContractError::config_validation(
                format!("devices[id={}]", device.device_id),
                "device_id must be non-empty, contain no '/' and not be 'all'",
            ));
        }
        if !seen.insert(&device.device_id) {
            return Err(ContractError::config_validation(
                format!("devices[id={}]", device.device_id),
                "duplicate device_id",
            ));
        }
        if device.sync_group.is_empty() {
            return Err(ContractError::config_validation(
                format!("devices[{}].sync_group", device.device_id),
                "sync_group cannot be empty",
            ));
        }
        non_negative(
            &format!("devices[{}].base_latency_ms", device.device_id),
            device.base_latency_ms,
        )?;
    }
    Ok(())
}

fn validate_groups(config: &SyncStreamConfig) -> Result<(), ContractError> {
    let mut seen = HashSet::new();
    for (idx, group) in config.groups.iter().enumerate() {
        if group.group_id.is_empty() {
            return Err(ContractError::config_validation(
                format!("groups[{idx}].group_id"),
                "group_id cannot be empty",
            ));
        }
        if !seen.insert(group.group_id.as_str()) {
            return Err(ContractError::config_validation(
                format!("groups[id={}]", group.group_id),
                "duplicate group_id",
            ));
        }
    }

    // 声明了 groups 时，设备引用的分组必须存在
    if !config.groups.is_empty() {
        for device in &config.devices {
            let group = device.sync_group.as_str();
            if group != DEFAULT_GROUP && !seen.contains(group) {
                return Err(ContractError::config_validation(
                    format!("devices[{}].sync_group", device.device_id),
                    format!("group '{group}' not found in groups"),
                ));
            }
        }
    }
    Ok(())
}

fn validate_preprocess(config: &SyncStreamConfig) -> Result<(), ContractError> {
    let p = &config.preprocess;
    positive("preprocess.highpass_cutoff_hz", p.highpass_cutoff_hz)?;
    positive("preprocess.target_rms", p.target_rms)?;
    positive("preprocess.min_window_s", p.min_window_s)?;
    if p.highpass_cutoff_hz >= MAX_HIGHPASS_CUTOFF_HZ {
        return Err(ContractError::config_validation(
            "preprocess.highpass_cutoff_hz",
            format!(
                "cutoff must be below {MAX_HIGHPASS_CUTOFF_HZ} Hz, got {}",
                p.highpass_cutoff_hz
            ),
        ));
    }
    if !(0.0..=0.5).contains(&p.edge_taper) {
        return Err(ContractError::config_validation(
            "preprocess.edge_taper",
            format!("must be within [0, 0.5], got {}", p.edge_taper),
        ));
    }
    Ok(())
}

fn validate_detector(config: &SyncStreamConfig) -> Result<(), ContractError> {
    let d = &config.detector;
    positive("detector.window_s", d.window_s)?;
    positive("detector.max_drift_ms", d.max_drift_ms)?;
    in_unit_interval("detector.min_correlation", d.min_correlation)?;
    non_negative("detector.peak_exclusion_ms", d.peak_exclusion_ms)?;
    if !(d.min_peak_ratio >= 1.0) {
        return Err(ContractError::config_validation(
            "detector.min_peak_ratio",
            format!("must be >= 1, got {}", d.min_peak_ratio),
        ));
    }
    if d.window_s < config.preprocess.min_window_s {
        return Err(ContractError::config_validation(
            "detector.window_s / preprocess.min_window_s",
            format!(
                "window_s ({}) must be >= min_window_s ({})",
                d.window_s, config.preprocess.min_window_s
            ),
        ));
    }
    Ok(())
}

/// 校验采样节奏
fn validate_sampling(config: &SyncStreamConfig) -> Result<(), ContractError> {
    let s = &config.sampling;
    positive("sampling.base_interval_s", s.base_interval_s)?;
    positive("sampling.max_interval_s", s.max_interval_s)?;
    positive("sampling.heartbeat_interval_s", s.heartbeat_interval_s)?;
    non_negative("sampling.lookback_s", s.lookback_s)?;
    if s.base_interval_s > s.max_interval_s {
        return Err(ContractError::config_validation(
            "sampling.base_interval_s / sampling.max_interval_s",
            format!(
                "base_interval_s ({}) must be <= max_interval_s ({})",
                s.base_interval_s, s.max_interval_s
            ),
        ));
    }
    if !(s.backoff_factor >= 1.0) {
        return Err(ContractError::config_validation(
            "sampling.backoff_factor",
            format!("must be >= 1, got {}", s.backoff_factor),
        ));
    }
    if s.heartbeat_interval_s >= config.registry.device_timeout_s {
        return Err(ContractError::config_validation(
            "sampling.heartbeat_interval_s / registry.device_timeout_s",
            format!(
                "heartbeat_interval_s ({}) must be < device_timeout_s ({})",
                s.heartbeat_interval_s, config.registry.device_timeout_s
            ),
        ));
    }
    Ok(())
}

/// 校验控制器参数
fn validate_controller(config: &SyncStreamConfig) -> Result<(), ContractError> {
    let c = &config.controller;
    if !(c.adjustment_rate > 0.0 && c.adjustment_rate <= 1.0) {
        return Err(ContractError::config_validation(
            "controller.adjustment_rate",
            format!("must be within (0, 1], got {}", c.adjustment_rate),
        ));
    }
    positive("controller.tolerance_ms", c.tolerance_ms)?;
    if let Some(step) = c.max_step_ms {
        positive("controller.max_step_ms", step)?;
    }
    non_negative("controller.settle_ms", c.settle_ms)?;
    if c.settle_ms > c.tolerance_ms {
        return Err(ContractError::config_validation(
            "controller.settle_ms / controller.tolerance_ms",
            format!(
                "settle_ms ({}) must be <= tolerance_ms ({})",
                c.settle_ms, c.tolerance_ms
            ),
        ));
    }
    positive("controller.outlier_sigma", c.outlier_sigma)?;
    non_negative("controller.min_outlier_sigma_ms", c.min_outlier_sigma_ms)?;
    non_negative(
        "controller.group_spread_tolerance_ms",
        c.group_spread_tolerance_ms,
    )?;
    positive("controller.stability_window_s", c.stability_window_s)?;
    if c.outlier_min_samples > config.registry.history_capacity {
        return Err(ContractError::config_validation(
            "controller.outlier_min_samples",
            format!(
                "outlier_min_samples ({}) cannot exceed registry.history_capacity ({})",
                c.outlier_min_samples, config.registry.history_capacity
            ),
        ));
    }

    let p = &c.predictive;
    positive("controller.predictive.interval_s", p.interval_s)?;
    positive("controller.predictive.horizon_s", p.horizon_s)?;
    positive("controller.predictive.trigger_ms", p.trigger_ms)?;
    positive("controller.predictive.step_ms", p.step_ms)?;
    non_negative(
        "controller.predictive.min_slope_ms_per_s",
        p.min_slope_ms_per_s,
    )?;
    in_unit_interval("controller.predictive.min_r2", p.min_r2)?;
    if p.min_samples < 2 {
        return Err(ContractError::config_validation(
            "controller.predictive.min_samples",
            "a trend needs at least 2 samples",
        ));
    }

    let q = &c.quality;
    if !(q.excellent_ms <= q.good_ms && q.good_ms <= q.fair_ms) {
        return Err(ContractError::config_validation(
            "controller.quality",
            format!(
                "thresholds must be ordered excellent <= good <= fair, got {} / {} / {}",
                q.excellent_ms, q.good_ms, q.fair_ms
            ),
        ));
    }
    non_negative("controller.quality.excellent_ms", q.excellent_ms)?;
    Ok(())
}

fn validate_registry(config: &SyncStreamConfig) -> Result<(), ContractError> {
    let r = &config.registry;
    positive("registry.device_timeout_s", r.device_timeout_s)?;
    positive("registry.sweep_interval_s", r.sweep_interval_s)?;
    non_negative("registry.evict_after_s", r.evict_after_s)?;
    if r.history_capacity == 0 {
        return Err(ContractError::config_validation(
            "registry.history_capacity",
            "history_capacity must be > 0",
        ));
    }
    if r.degrade_after_rejects == 0 {
        return Err(ContractError::config_validation(
            "registry.degrade_after_rejects",
            "degrade_after_rejects must be > 0",
        ));
    }
    Ok(())
}

fn validate_channel(config: &SyncStreamConfig) -> Result<(), ContractError> {
    let ch = &config.channel;
    if ch.topic_prefix.is_empty() || ch.topic_prefix.contains('/') {
        return Err(ContractError::config_validation(
            "channel.topic_prefix",
            "topic_prefix must be a single non-empty segment",
        ));
    }
    if ch.inbound_capacity == 0 || ch.link_queue_capacity == 0 {
        return Err(ContractError::config_validation(
            "channel",
            "queue capacities must be > 0",
        ));
    }
    Ok(())
}
