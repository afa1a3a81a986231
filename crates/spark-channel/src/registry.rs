//! # registry：可注入的工厂共享注册表
//!
//! ## 意图（Why）
//! - 工厂缓存与共享策略闩锁按契约类型划分，且必须在进程内唯一；若直接做成全局静态变量，
//!   测试之间会互相污染，也无法在宿主关闭时统一拆除；
//! - 注册表把二者收拢为一个显式服务：生产代码使用 [`SharingRegistry::global`]，
//!   测试各自构造独立实例并注入 [`crate::ClientProxy::with_registry`]。
//!
//! ## 契约（What）
//! - 每个契约类型对应一个 [`SharingDomain`]，首次访问时按注册表配置创建；
//! - 共享策略在冻结前可通过 [`SharingRegistry::set_cache_setting`] 修改，冻结后修改返回
//!   `InvalidState`；
//! - [`SharingRegistry::shutdown`] 清空全部缓存，释放缓存自身的持有。

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::info;

use crate::cache::FactoryCache;
use crate::config::ChannelSettings;
use crate::endpoint::{ContractId, ServiceContract};
use crate::error::Result;
use crate::sharing::{CacheSetting, SettingLatch};
use crate::time::{SharedClock, system_clock};

/// 单个契约类型的共享域：一个策略闩锁与一个工厂缓存。
pub struct SharingDomain {
    contract: ContractId,
    latch: SettingLatch,
    cache: FactoryCache,
}

impl SharingDomain {
    fn new(contract: ContractId, settings: &ChannelSettings) -> Self {
        Self {
            contract,
            latch: SettingLatch::new(settings.cache_setting),
            cache: FactoryCache::new(settings.cache_capacity, settings.retain_idle_factories),
        }
    }

    pub fn contract(&self) -> &ContractId {
        &self.contract
    }

    pub fn cache(&self) -> &FactoryCache {
        &self.cache
    }

    pub fn latch(&self) -> &SettingLatch {
        &self.latch
    }
}

impl fmt::Debug for SharingDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharingDomain")
            .field("contract", &self.contract)
            .field("latch", &self.latch)
            .field("cache", &self.cache)
            .finish()
    }
}

/// 工厂共享注册表。
///
/// # 教案式说明
/// - **意图 (Why)**：以受控生命周期替代进程级静态缓存；
/// - **契约 (What)**：注册表内的所有代理共享同一份 [`ChannelSettings`] 与时钟；
/// - **风险 (Trade-offs)**：不同注册表之间互不可见，同一进程内混用多个注册表会得到多份工厂。
pub struct SharingRegistry {
    settings: ChannelSettings,
    clock: SharedClock,
    domains: Mutex<HashMap<TypeId, Arc<SharingDomain>>>,
}

impl SharingRegistry {
    /// 以给定配置与系统时钟构造注册表。
    pub fn new(settings: ChannelSettings) -> Result<Self> {
        Self::with_clock(settings, system_clock())
    }

    /// 以给定配置与时钟构造注册表；配置非法时返回 `ArgumentInvalid`。
    pub fn with_clock(settings: ChannelSettings, clock: SharedClock) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            clock,
            domains: Mutex::new(HashMap::new()),
        })
    }

    /// 进程级注册表，使用默认配置，首次访问时创建。
    pub fn global() -> Arc<SharingRegistry> {
        static GLOBAL: OnceLock<Arc<SharingRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| {
            Arc::new(Self {
                settings: ChannelSettings::default(),
                clock: system_clock(),
                domains: Mutex::new(HashMap::new()),
            })
        }))
    }

    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// 契约类型 `C` 的共享域。
    pub fn domain<C: ServiceContract>(&self) -> Arc<SharingDomain> {
        let mut domains = self.domains.lock();
        Arc::clone(
            domains
                .entry(TypeId::of::<C>())
                .or_insert_with(|| Arc::new(SharingDomain::new(ContractId::of::<C>(), &self.settings))),
        )
    }

    /// 在冻结前修改契约类型 `C` 的共享策略。
    pub fn set_cache_setting<C: ServiceContract>(&self, value: CacheSetting) -> Result<()> {
        self.domain::<C>().latch().set(value)
    }

    /// 读取契约类型 `C` 的共享策略，不触发冻结。
    pub fn cache_setting<C: ServiceContract>(&self) -> CacheSetting {
        self.domain::<C>().latch().peek()
    }

    /// 清空全部共享域的缓存。
    pub fn shutdown(&self) {
        let domains: Vec<_> = self.domains.lock().values().cloned().collect();
        for domain in &domains {
            domain.cache().clear();
        }
        info!(domains = domains.len(), "sharing registry shut down");
    }
}

impl fmt::Debug for SharingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharingRegistry")
            .field("settings", &self.settings)
            .field("domains", &self.domains.lock().len())
            .finish()
    }
}
