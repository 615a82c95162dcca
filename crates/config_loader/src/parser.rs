//! 配置解析模块
//!
//! 支持 TOML (主要) 和 JSON (可选) 格式。

use contracts::{ContractError, SyncStreamConfig};

/// 配置文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// TOML 格式 (推荐)
    Toml,
    /// JSON 格式
    Json,
}

impl ConfigFormat {
    /// 从文件扩展名推断格式
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "toml" => Some(Self::Toml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// 解析 TOML 格式配置
pub fn parse_toml(content: &str) -> Result<SyncStreamConfig, ContractError> {
    toml::from_str(content).map_err(|e| ContractError::ConfigParse {
        message: format!("TOML parse error: {e}"),
        source: Some(Box::new(e)),
    })
}

/// 解析 JSON 格式配置
pub fn parse_json(content: &str) -> Result<SyncStreamConfig, ContractError> {
    serde_json::from_str(content).map_err(|e| ContractError::ConfigParse {
        message: format!("JSON parse error: {e}"),
        source: Some(Box::new(e)),
    })
}

/// 根据格式解析配置
pub fn parse(content: &str, format: ConfigFormat) -> Result<SyncStreamConfig, ContractError> {
    match format {
        ConfigFormat::Toml => parse_toml(content),
        ConfigFormat::Json => parse_json(content),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::DeviceType;

    #[test]
    fn test_parse_toml_devices_and_sections() {
        let content = r#"
[controller]
tolerance_ms = 10.0
adjustment_rate = 0.3

[controller.predictive]
enabled = false

[[devices]]
device_id = "kitchen"
device_type = "chromecast"
base_latency_ms = 42.0
sync_group = "downstairs"

[[devices]]
device_id = "hall"
"#;
        let result = parse_toml(content);
        assert!(result.is_ok(), "Failed: {:?}", result.err());
        let config = result.unwrap();
        assert_eq!(config.controller.tolerance_ms, 10.0);
        assert_eq!(config.controller.adjustment_rate, 0.3);
        assert!(!config.controller.predictive.enabled);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].device_type, DeviceType::Chromecast);
        assert_eq!(config.devices[0].sync_group, "downstairs");
        // 未指定的字段使用默认值
        assert_eq!(config.devices[1].sync_group, "default");
        assert_eq!(config.devices[1].base_latency_ms, 0.0);
    }

    #[test]
    fn test_parse_empty_toml_is_default() {
        let config = parse_toml("").unwrap();
        assert_eq!(config.detector.min_correlation, 0.7);
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_parse_json_minimal() {
        let content = r#"{
            "detector": { "max_drift_ms": 500.0 },
            "registry": { "device_timeout_s": 10.0 },
            "groups": [{ "group_id": "upstairs", "priority": 2 }]
        }"#;
        let result = parse_json(content);
        assert!(result.is_ok(), "Failed: {:?}", result.err());
        let config = result.unwrap();
        assert_eq!(config.detector.max_drift_ms, 500.0);
        assert_eq!(config.groups[0].priority, 2);
    }

    #[test]
    fn test_parse_toml_syntax_error() {
        let content = "invalid toml [[[";
        let result = parse_toml(content);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ContractError::ConfigParse { .. }));
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(
            ConfigFormat::from_extension("toml"),
            Some(ConfigFormat::Toml)
        );
        assert_eq!(
            ConfigFormat::from_extension("TOML"),
            Some(ConfigFormat::Toml)
        );
        assert_eq!(
            ConfigFormat::from_extension("json"),
            Some(ConfigFormat::Json)
        );
        assert_eq!(ConfigFormat::from_extension("yaml"), None);
    }
}
