//! 工厂共享策略与一次性冻结闩锁。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, ErrorKind, Result, codes};

/// 进程级的工厂共享策略。
///
/// - `Default`：允许共享，但调用方在共享定型前定制工厂会使该代理退出共享；
/// - `AlwaysOn`：始终共享，定制工厂也不会退出共享；
/// - `AlwaysOff`：从不共享，每个代理持有私有工厂。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSetting {
    #[default]
    Default,
    AlwaysOn,
    AlwaysOff,
}

impl CacheSetting {
    pub const fn allows_sharing(self) -> bool {
        !matches!(self, CacheSetting::AlwaysOff)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            CacheSetting::Default => "default",
            CacheSetting::AlwaysOn => "always_on",
            CacheSetting::AlwaysOff => "always_off",
        }
    }
}

/// 首次读取即冻结的共享策略闩锁。
///
/// # 教案式说明
/// - **意图 (Why)**：已经按某策略构造出的代理与后续代理必须看到同一策略，否则缓存里会混入
///   不该共享的工厂；
/// - **契约 (What)**：[`SettingLatch::read_and_freeze`] 之后的 [`SettingLatch::set`] 一律失败，
///   返回 `InvalidState`（错误码 `channel.sharing.frozen`），而不是静默忽略；
/// - **实现 (How)**：值与冻结标记放在同一把锁里，`set` 与首次读取之间不存在竞态窗口。
#[derive(Debug)]
pub struct SettingLatch {
    slot: Mutex<LatchSlot>,
}

#[derive(Debug)]
struct LatchSlot {
    value: CacheSetting,
    frozen: bool,
}

impl SettingLatch {
    pub fn new(initial: CacheSetting) -> Self {
        Self {
            slot: Mutex::new(LatchSlot {
                value: initial,
                frozen: false,
            }),
        }
    }

    /// 在冻结前修改策略。
    pub fn set(&self, value: CacheSetting) -> Result<()> {
        let mut slot = self.slot.lock();
        if slot.frozen {
            return Err(ChannelError::new(
                ErrorKind::InvalidState,
                codes::SETTING_FROZEN,
                format!(
                    "cache setting is frozen at `{}` and cannot change to `{}`",
                    slot.value.as_str(),
                    value.as_str()
                ),
            ));
        }
        slot.value = value;
        Ok(())
    }

    /// 读取策略并冻结。
    pub fn read_and_freeze(&self) -> CacheSetting {
        let mut slot = self.slot.lock();
        slot.frozen = true;
        slot.value
    }

    /// 只读窥视，不触发冻结。
    pub fn peek(&self) -> CacheSetting {
        self.slot.lock().value
    }

    pub fn is_frozen(&self) -> bool {
        self.slot.lock().frozen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_after_freeze_fails_loudly() {
        let latch = SettingLatch::new(CacheSetting::Default);
        latch.set(CacheSetting::AlwaysOn).unwrap();
        assert_eq!(latch.peek(), CacheSetting::AlwaysOn);
        assert!(!latch.is_frozen());

        assert_eq!(latch.read_and_freeze(), CacheSetting::AlwaysOn);
        let err = latch.set(CacheSetting::AlwaysOff).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(err.code(), codes::SETTING_FROZEN);
        assert_eq!(latch.peek(), CacheSetting::AlwaysOn);
    }

    #[test]
    fn setting_names_match_config_spelling() {
        let settings: Vec<CacheSetting> =
            toml::from_str::<std::collections::BTreeMap<String, CacheSetting>>(
                "a = \"default\"\nb = \"always_on\"\nc = \"always_off\"",
            )
            .unwrap()
            .into_values()
            .collect();
        assert_eq!(
            settings,
            vec![
                CacheSetting::Default,
                CacheSetting::AlwaysOn,
                CacheSetting::AlwaysOff
            ]
        );
    }
}
