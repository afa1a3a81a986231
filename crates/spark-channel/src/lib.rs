//! # spark-channel
//!
//! ## 定位与职责（Why）
//! - 作为 RPC 客户端的生命周期与资源共享核心，负责在并发调用者之间安全地打开、共享与拆除
//!   代价高昂的通信资源：通道工厂、通道与服务端实例上下文；
//! - 为同步与异步调用者提供一致的“恰好一次”打开/关闭语义，并在共享资源失效时平滑降级。
//!
//! ## 架构嵌入（Where）
//! - `lifecycle` 模块提供通用状态机 [`CommunicationObject`]，其余资源都以组合方式复用它；
//! - `factory`/`channel` 模块把生命周期委托给外部传输栈（见 `transport` 模块的契约）；
//! - `refcount`/`cache`/`registry` 模块负责工厂的引用计数、有界缓存与按契约划分的共享域；
//! - `proxy` 模块是调用点门面，`instance` 模块是服务端的实例上下文；
//! - `config`/`error`/`observability`/`time` 模块提供配置、错误域、日志键名与可注入时钟。
//!
//! ## 范围之外（Trade-offs）
//! - 不包含消息编码、安全与绑定协商、具体传输实现与服务端分发管线，这些由上层 crate 通过
//!   [`Binding`]、[`TransportFactory`] 与 [`TransportChannel`] 接入。

/// 共享通道工厂的有界缓存。
pub mod cache;
/// 单个通道的生命周期包装。
pub mod channel;
/// 通道配置与 TOML 加载。
pub mod config;
/// 端点描述与结构化端点特征。
pub mod endpoint;
/// 统一错误域与稳定错误码。
///
/// - **意图说明 (Why)**：代理依据错误分类决定是否降级重试，错误码供日志与告警检索；
/// - **契约定位 (What)**：使用 `thiserror::Error` 派生 [`ChannelError`]。
pub mod error;
/// 通道工厂。
pub mod factory;
/// 服务端实例上下文。
pub mod instance;
/// 通用生命周期状态机。
pub mod lifecycle;
/// 结构化日志键名。
pub mod observability;
/// 客户端代理。
pub mod proxy;
/// 带权威引用计数的工厂。
pub mod refcount;
/// 按契约类型划分的共享注册表。
pub mod registry;
/// 共享策略与冻结闩锁。
pub mod sharing;
/// 生命周期状态与事件。
pub mod state;
/// 可注入时钟与超时预算。
pub mod time;
/// 被消费的传输层契约。
pub mod transport;

pub use cache::FactoryCache;
pub use channel::{ChannelId, ServiceChannel};
pub use config::{ChannelSettings, DEFAULT_CACHE_CAPACITY, DEFAULT_TIMEOUT};
pub use endpoint::{
    BindingId, CallbackIdentity, ContractId, EndpointAddress, EndpointDescription, EndpointTrait,
    ServiceContract,
};
pub use error::{ChannelError, ErrorKind, Result};
pub use factory::ChannelFactory;
pub use instance::{DispatchTicket, InstanceContext, InstanceContextMode};
pub use lifecycle::{CommunicationObject, DefaultTimeouts, LifecycleHooks, LifecycleListener};
pub use proxy::ClientProxy;
pub use refcount::RefCountedFactory;
pub use registry::{SharingDomain, SharingRegistry};
pub use sharing::{CacheSetting, SettingLatch};
pub use state::{CommunicationState, LifecycleEvent};
pub use time::{Clock, MockClock, SharedClock, SystemClock, TimeoutBudget, system_clock};
pub use transport::{Binding, ChannelShape, TransportChannel, TransportFactory};
