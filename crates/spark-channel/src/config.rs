//! # config：通道生命周期配置
//!
//! ## 意图（Why）
//! - 默认超时、缓存容量与共享策略需要可由宿主配置文件覆盖，而不是散落在各组件的常量中；
//! - 配置只在构造期读取一次，运行期修改共享策略必须通过 [`crate::SharingRegistry`] 的一次性闩锁。
//!
//! ## 契约（What）
//! - TOML 字段：`open_timeout_ms`、`close_timeout_ms`、`cache_capacity`、`cache_setting`、
//!   `retain_idle_factories`，缺省字段取默认值，未知字段报错；
//! - 超时与容量必须大于零，否则返回 `ArgumentInvalid`。

use std::time::Duration;

use serde::Deserialize;

use crate::error::{ChannelError, ErrorKind, Result, codes};
use crate::sharing::CacheSetting;

/// 工厂缓存的默认容量。
pub const DEFAULT_CACHE_CAPACITY: usize = 32;

/// 默认打开/关闭超时。
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// 生效后的通道配置。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - `open_timeout`/`close_timeout`：无参 Open/Close 使用的默认预算；
///   - `cache_capacity`：每个契约类型的工厂缓存容量；
///   - `cache_setting`：共享策略的初始值，首次读取后冻结；
///   - `retain_idle_factories`：最后一个代理释放后是否仍把工厂留在缓存中预热，
///     默认 `false`，即随最后一次释放一并拆除；
/// - **风险 (Trade-offs)**：开启 `retain_idle_factories` 后工厂只会在被淘汰或注册表关闭时拆除。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSettings {
    pub open_timeout: Duration,
    pub close_timeout: Duration,
    pub cache_capacity: usize,
    pub cache_setting: CacheSetting,
    pub retain_idle_factories: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            open_timeout: DEFAULT_TIMEOUT,
            close_timeout: DEFAULT_TIMEOUT,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_setting: CacheSetting::Default,
            retain_idle_factories: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawSettings {
    open_timeout_ms: u64,
    close_timeout_ms: u64,
    cache_capacity: usize,
    cache_setting: CacheSetting,
    retain_idle_factories: bool,
}

impl Default for RawSettings {
    fn default() -> Self {
        let defaults = ChannelSettings::default();
        Self {
            open_timeout_ms: u64::try_from(defaults.open_timeout.as_millis()).unwrap_or(u64::MAX),
            close_timeout_ms: u64::try_from(defaults.close_timeout.as_millis()).unwrap_or(u64::MAX),
            cache_capacity: defaults.cache_capacity,
            cache_setting: defaults.cache_setting,
            retain_idle_factories: defaults.retain_idle_factories,
        }
    }
}

impl ChannelSettings {
    /// 从 TOML 文本解析配置。
    ///
    /// # 示例
    /// ```rust
    /// use spark_channel::{CacheSetting, ChannelSettings};
    ///
    /// let settings = ChannelSettings::from_toml_str(
    ///     "open_timeout_ms = 1500\ncache_setting = \"always_off\"",
    /// )
    /// .unwrap();
    /// assert_eq!(settings.open_timeout.as_millis(), 1500);
    /// assert_eq!(settings.cache_setting, CacheSetting::AlwaysOff);
    /// assert_eq!(settings.cache_capacity, 32);
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let raw: RawSettings = toml::from_str(text).map_err(|err| {
            ChannelError::new(
                ErrorKind::ArgumentInvalid,
                codes::CONFIG_PARSE,
                "channel settings are not valid TOML",
            )
            .with_source(err)
        })?;
        let settings = Self {
            open_timeout: Duration::from_millis(raw.open_timeout_ms),
            close_timeout: Duration::from_millis(raw.close_timeout_ms),
            cache_capacity: raw.cache_capacity,
            cache_setting: raw.cache_setting,
            retain_idle_factories: raw.retain_idle_factories,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// 校验取值范围。
    pub fn validate(&self) -> Result<()> {
        if self.open_timeout.is_zero() || self.close_timeout.is_zero() {
            return Err(ChannelError::argument_invalid(
                "open and close timeouts must be greater than zero",
            ));
        }
        if self.cache_capacity == 0 {
            return Err(ChannelError::argument_invalid(
                "cache_capacity must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        assert_eq!(
            ChannelSettings::from_toml_str("").unwrap(),
            ChannelSettings::default()
        );
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = ChannelSettings::from_toml_str("cache_capacity = 0").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentInvalid);
        assert_eq!(err.code(), codes::ARGUMENT_INVALID);
    }

    #[test]
    fn unknown_fields_are_reported_with_source() {
        let err = ChannelSettings::from_toml_str("cache_size = 8").unwrap_err();
        assert_eq!(err.code(), codes::CONFIG_PARSE);
        assert!(std::error::Error::source(&err).is_some());
    }
}
