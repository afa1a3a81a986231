//! 结构化日志键名：生命周期、缓存与代理日志统一引用的字段名。
//!
//! 键名一经发布即视为契约，告警与检索规则依赖它们保持稳定。

/// 生命周期迁移日志字段。
pub mod lifecycle {
    /// 对象的人类可读标签（如 `factory:calc/basic-http`）。
    pub const FIELD_LABEL: &str = "lifecycle.label";
    /// 迁移事件名称。
    pub const FIELD_EVENT: &str = "lifecycle.event";
    /// 当前状态。
    pub const FIELD_STATE: &str = "lifecycle.state";
    /// 本次操作的剩余预算（毫秒）。
    pub const FIELD_BUDGET_MS: &str = "lifecycle.budget.ms";
}

/// 工厂缓存日志字段。
pub mod cache {
    /// 端点特征摘要。
    pub const FIELD_TRAIT: &str = "cache.trait";
    /// 当前缓存条目数。
    pub const FIELD_LEN: &str = "cache.len";
    /// 淘汰原因：`stale`、`overflow`、`removed`、`cleared`。
    pub const FIELD_EVICT_REASON: &str = "cache.evict.reason";
    /// 引用计数快照。
    pub const FIELD_REFS: &str = "cache.refs";
}

/// 客户端代理日志字段。
pub mod proxy {
    /// 契约名称。
    pub const FIELD_CONTRACT: &str = "proxy.contract";
    /// 触发降级的错误码。
    pub const FIELD_ERROR_CODE: &str = "proxy.error.code";
    /// 错误分类。
    pub const FIELD_ERROR_KIND: &str = "proxy.error.kind";
}

/// 实例上下文日志字段。
pub mod instance {
    /// 实例模式。
    pub const FIELD_MODE: &str = "instance.mode";
    /// 忙碌计数。
    pub const FIELD_BUSY: &str = "instance.busy";
    /// 已绑定通道数。
    pub const FIELD_CHANNELS: &str = "instance.channels";
}
