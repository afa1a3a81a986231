//! # proxy：客户端代理
//!
//! ## 核心意图（Why）
//! - 代理是调用点的门面：每个代理拥有且仅拥有一个惰性创建的通道，而通道工厂则尽可能在
//!   结构等价的代理之间共享；
//! - 代理本身也是生命周期对象，其 Open/Close 按链式顺序编排工厂与通道：
//!   打开时先工厂后通道，关闭时先通道后工厂。
//!
//! ## 行为契约（What）
//! - 构造期校验契约、绑定与回调，并读取（冻结）该契约类型的共享策略；
//! - 工厂在首次创建通道时解析：允许共享时经缓存单飞查找，否则构造私有工厂；
//! - 通过新工厂成功创建首个通道后才把工厂登记进缓存；
//! - 经缓存工厂创建通道遇到瞬态错误时，移除陈旧条目、永久退出共享，并用私有工厂重试一次；
//! - 无论 Close 与 Abort 谁先发生，工厂引用恰好释放一次；释放到最后一个引用时，
//!   缓存来源的工厂被中止，私有工厂被优雅关闭。
//!
//! ## 风险提示（Trade-offs）
//! - 代理被 drop 时执行 `abort`，未显式关闭的代理不会泄漏工厂引用，但也不会优雅关闭通道。

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::cache::{BuildPermit, Resolution};
use crate::channel::ServiceChannel;
use crate::endpoint::{CallbackIdentity, ContractId, EndpointDescription, EndpointTrait, ServiceContract};
use crate::error::{ChannelError, Result};
use crate::factory::ChannelFactory;
use crate::lifecycle::{CommunicationObject, DefaultTimeouts, LifecycleHooks};
use crate::observability::proxy as keys;
use crate::refcount::RefCountedFactory;
use crate::registry::{SharingDomain, SharingRegistry};
use crate::sharing::CacheSetting;
use crate::state::CommunicationState;
use crate::time::TimeoutBudget;
use crate::transport::ChannelShape;

#[derive(Default)]
struct ProxyState {
    channel: Option<Arc<ServiceChannel>>,
    factory: Option<Arc<RefCountedFactory>>,
    can_share: bool,
    using_cached: bool,
    sharing_finalized: bool,
    factory_released: bool,
    released_last_ref: bool,
}

/// 代理的生命周期钩子：编排工厂引用与通道。
pub struct ProxyCore {
    label: Arc<str>,
    endpoint: EndpointTrait,
    description: EndpointDescription,
    shape: ChannelShape,
    setting: CacheSetting,
    registry: Arc<SharingRegistry>,
    domain: Arc<SharingDomain>,
    state: Mutex<ProxyState>,
    channel_gate: AsyncMutex<()>,
}

impl ProxyCore {
    fn current_channel(&self) -> Option<Arc<ServiceChannel>> {
        self.state.lock().channel.clone()
    }

    fn build_private(&self) -> Result<Arc<RefCountedFactory>> {
        let factory = ChannelFactory::with_clock(
            self.description.clone(),
            self.registry.settings(),
            Arc::clone(self.registry.clock()),
        )?;
        Ok(RefCountedFactory::new(Arc::new(factory)))
    }

    /// 释放一个不再由本代理持有的引用；若为最后一个则就地中止工厂。
    fn dispose_reference(&self, factory: &Arc<RefCountedFactory>, cached: bool) {
        let last = if cached {
            self.domain.cache().release_member(&self.endpoint, factory)
        } else {
            factory.release()
        };
        if last {
            factory.factory().abort();
        }
    }

    /// 把解析出的工厂交给代理；代理已释放工厂时拒绝并归还引用。
    fn install(&self, factory: &Arc<RefCountedFactory>, cached: bool) -> Result<()> {
        {
            let mut state = self.state.lock();
            if !state.factory_released {
                state.factory = Some(Arc::clone(factory));
                state.using_cached = cached;
                return Ok(());
            }
        }
        self.dispose_reference(factory, cached);
        Err(ChannelError::aborted(&self.label))
    }

    /// 双重检查地取得本代理唯一的通道，必要时解析工厂并创建。
    async fn ensure_channel(&self, budget: &TimeoutBudget) -> Result<Arc<ServiceChannel>> {
        if let Some(channel) = self.current_channel() {
            return Ok(channel);
        }
        let _gate = match self.channel_gate.try_lock() {
            Ok(gate) => gate,
            Err(_) => budget.bound("proxy.channel.gate", self.channel_gate.lock()).await?,
        };
        if let Some(channel) = self.current_channel() {
            return Ok(channel);
        }

        let (existing, cached, can_share) = {
            let state = self.state.lock();
            (state.factory.clone(), state.using_cached, state.can_share)
        };
        match existing {
            Some(factory) => self.create_through(factory, cached, None, budget).await,
            None if can_share => match self.domain.cache().resolve(&self.endpoint, budget).await? {
                Resolution::Cached(factory) => {
                    self.install(&factory, true)?;
                    self.create_through(factory, true, None, budget).await
                }
                Resolution::Build(permit) => {
                    let factory = self.build_private()?;
                    self.install(&factory, false)?;
                    self.create_through(factory, false, Some(permit), budget).await
                }
            },
            None => {
                let factory = self.build_private()?;
                self.install(&factory, false)?;
                self.create_through(factory, false, None, budget).await
            }
        }
    }

    async fn create_through(
        &self,
        factory: Arc<RefCountedFactory>,
        cached: bool,
        permit: Option<BuildPermit<'_>>,
        budget: &TimeoutBudget,
    ) -> Result<Arc<ServiceChannel>> {
        let remaining = budget.remaining_for("proxy.factory.open")?;
        match open_channel_on(&factory, self.shape, remaining).await {
            Ok(channel) => self.finish(channel, &factory, cached, permit),
            Err(err) if cached && err.is_transient() => self.fall_back(factory, err, budget).await,
            Err(err) => Err(err),
        }
    }

    /// 缓存工厂失效后的降级：移除陈旧条目、永久退出共享，并以私有工厂重试一次。
    async fn fall_back(
        &self,
        stale: Arc<RefCountedFactory>,
        cause: ChannelError,
        budget: &TimeoutBudget,
    ) -> Result<Arc<ServiceChannel>> {
        warn!(
            { keys::FIELD_CONTRACT } = self.endpoint.contract().as_str(),
            { keys::FIELD_ERROR_CODE } = cause.code(),
            { keys::FIELD_ERROR_KIND } = cause.kind().as_str(),
            error = %cause,
            "cached channel factory failed, retrying with a private factory"
        );
        self.domain.cache().remove_if_same(&self.endpoint, &stale);

        let private = self.build_private()?;
        let previous = {
            let mut state = self.state.lock();
            if state.factory_released {
                None
            } else {
                state.can_share = false;
                state.sharing_finalized = true;
                state.using_cached = false;
                Some(state.factory.replace(Arc::clone(&private)))
            }
        };
        let Some(previous) = previous else {
            private.factory().abort();
            return Err(ChannelError::aborted(&self.label));
        };
        // 条目已移除，直接释放本代理对陈旧工厂的持有。
        if let Some(previous) = previous {
            if previous.release() {
                previous.factory().abort();
            }
        }

        let remaining = budget.remaining_for("proxy.factory.open")?;
        let channel = open_channel_on(&private, self.shape, remaining).await?;
        self.finish(channel, &private, false, None)
    }

    fn finish(
        &self,
        channel: Arc<ServiceChannel>,
        factory: &Arc<RefCountedFactory>,
        cached: bool,
        permit: Option<BuildPermit<'_>>,
    ) -> Result<Arc<ServiceChannel>> {
        let mut state = self.state.lock();
        if state.factory_released {
            drop(state);
            channel.abort();
            return Err(ChannelError::aborted(&self.label));
        }
        state.channel = Some(Arc::clone(&channel));
        state.sharing_finalized = true;
        if !cached && state.can_share {
            let published = match permit {
                Some(permit) => permit.publish(factory),
                None => self.domain.cache().try_publish(&self.endpoint, factory),
            };
            state.using_cached = published;
        }
        debug!(
            { keys::FIELD_CONTRACT } = self.endpoint.contract().as_str(),
            channel = %channel.id(),
            shared = state.using_cached,
            "proxy channel created"
        );
        Ok(channel)
    }

    /// 恰好一次地释放工厂引用；若释放的是最后一个引用，返回需由本代理拆除的工厂及其来源。
    fn release_factory(&self) -> Option<(Arc<RefCountedFactory>, bool)> {
        let (factory, cached) = {
            let mut state = self.state.lock();
            if state.factory_released {
                return None;
            }
            state.factory_released = true;
            (state.factory.clone()?, state.using_cached)
        };
        let last = if cached {
            self.domain.cache().release_member(&self.endpoint, &factory)
        } else {
            factory.release()
        };
        self.state.lock().released_last_ref = last;
        debug!(
            { keys::FIELD_CONTRACT } = self.endpoint.contract().as_str(),
            last,
            cached,
            "proxy released channel factory"
        );
        last.then_some((factory, cached))
    }
}

async fn open_channel_on(
    factory: &RefCountedFactory,
    shape: ChannelShape,
    remaining: Duration,
) -> Result<Arc<ServiceChannel>> {
    factory.factory().ensure_opened(remaining).await?;
    factory.factory().create_channel_opened(shape)
}

#[async_trait]
impl LifecycleHooks for ProxyCore {
    async fn on_open(&self, budget: &TimeoutBudget) -> Result<()> {
        let channel = self.ensure_channel(budget).await?;
        let remaining = budget.remaining_for("proxy.channel.open")?;
        channel.open_with_timeout(remaining).await
    }

    async fn on_close(&self, budget: &TimeoutBudget) -> Result<()> {
        let channel_result = match self.current_channel() {
            Some(channel) => match budget.remaining_for("proxy.channel.close") {
                Ok(remaining) => channel.close_with_timeout(remaining).await,
                Err(err) => {
                    channel.abort();
                    Err(err)
                }
            },
            None => Ok(()),
        };

        let factory_result = match self.release_factory() {
            Some((factory, false)) if factory.factory().state() == CommunicationState::Opened => {
                match budget.remaining_for("proxy.factory.close") {
                    Ok(remaining) => factory.factory().close_with_timeout(remaining).await,
                    Err(err) => {
                        factory.factory().abort();
                        Err(err)
                    }
                }
            }
            Some((factory, _)) => {
                factory.factory().abort();
                Ok(())
            }
            None => Ok(()),
        };
        channel_result.and(factory_result)
    }

    fn on_abort(&self) {
        if let Some(channel) = self.current_channel() {
            channel.abort();
        }
        if let Some((factory, _)) = self.release_factory() {
            factory.factory().abort();
        }
    }
}

/// 契约 `C` 的客户端代理。
///
/// # 教案式说明
/// - **意图 (Why)**：调用方只面对“打开、取通道、关闭”三件事，工厂共享、降级与引用计数
///   全部隐藏在代理内部；
/// - **契约 (What)**：
///   - [`ClientProxy::open`]：先确保工厂打开并创建通道，再打开通道；
///   - [`ClientProxy::channel`]：首次调用时隐式打开代理；
///   - [`ClientProxy::close`]/[`ClientProxy::abort`]：任意顺序、任意次数调用，工厂引用只释放一次；
/// - **示例 (How)**：
/// ```rust,ignore
/// let proxy = ClientProxy::<Calculator>::with_registry(registry, description)?;
/// let channel = proxy.channel().await?;
/// // ... 通过 channel.transport() 收发消息 ...
/// proxy.close().await?;
/// ```
pub struct ClientProxy<C: ServiceContract> {
    object: CommunicationObject<ProxyCore>,
    _contract: PhantomData<fn() -> C>,
}

impl<C: ServiceContract> ClientProxy<C> {
    /// 基于进程级注册表构造代理。
    pub fn new(description: EndpointDescription) -> Result<Self> {
        Self::build(SharingRegistry::global(), description, None)
    }

    /// 基于注入的注册表构造代理。
    pub fn with_registry(registry: Arc<SharingRegistry>, description: EndpointDescription) -> Result<Self> {
        Self::build(registry, description, None)
    }

    /// 构造携带回调实例的双工代理；回调实例参与端点特征比较。
    pub fn with_callback<T: Any + Send + Sync>(
        registry: Arc<SharingRegistry>,
        description: EndpointDescription,
        callback: &Arc<T>,
    ) -> Result<Self> {
        Self::build(registry, description, Some(CallbackIdentity::of(callback)))
    }

    fn build(
        registry: Arc<SharingRegistry>,
        description: EndpointDescription,
        callback: Option<CallbackIdentity>,
    ) -> Result<Self> {
        let expected = ContractId::of::<C>();
        if description.contract() != &expected {
            return Err(ChannelError::argument_invalid(format!(
                "endpoint contract `{}` does not match proxy contract `{}`",
                description.contract().as_str(),
                expected.as_str()
            )));
        }
        if !description.binding().supports(C::SHAPE) {
            return Err(ChannelError::argument_invalid(format!(
                "binding `{}` does not support {} channels required by `{}`",
                description.binding().identity().name(),
                C::SHAPE,
                C::NAME
            )));
        }
        match (C::SHAPE, callback.is_some()) {
            (ChannelShape::Duplex, false) => {
                return Err(ChannelError::argument_invalid(format!(
                    "duplex contract `{}` requires a callback instance",
                    C::NAME
                )));
            }
            (ChannelShape::RequestReply | ChannelShape::OneWay, true) => {
                return Err(ChannelError::argument_invalid(format!(
                    "contract `{}` is not duplex and cannot carry a callback instance",
                    C::NAME
                )));
            }
            _ => {}
        }

        let domain = registry.domain::<C>();
        let setting = domain.latch().read_and_freeze();
        let endpoint = EndpointTrait::from_description(&description, callback);
        let label: Arc<str> = Arc::from(format!("proxy:{endpoint}"));
        let timeouts = DefaultTimeouts::from_settings(registry.settings());
        let clock = Arc::clone(registry.clock());
        let core = ProxyCore {
            label: Arc::clone(&label),
            endpoint,
            description,
            shape: C::SHAPE,
            setting,
            registry,
            domain,
            state: Mutex::new(ProxyState {
                can_share: setting.allows_sharing(),
                ..ProxyState::default()
            }),
            channel_gate: AsyncMutex::new(()),
        };
        Ok(Self {
            object: CommunicationObject::new(label.to_string(), core)
                .with_timeouts(timeouts)
                .with_clock(clock),
            _contract: PhantomData,
        })
    }

    fn core(&self) -> &ProxyCore {
        self.object.hooks()
    }

    pub fn endpoint(&self) -> &EndpointTrait {
        &self.core().endpoint
    }

    /// 构造时读取并冻结的共享策略。
    pub fn cache_setting(&self) -> CacheSetting {
        self.core().setting
    }

    pub fn state(&self) -> CommunicationState {
        self.object.state()
    }

    pub fn lifecycle(&self) -> &CommunicationObject<ProxyCore> {
        &self.object
    }

    /// 代理最终是否使用缓存中的共享工厂。
    pub fn shares_factory(&self) -> bool {
        self.core().state.lock().using_cached
    }

    /// 代理是否仍有资格共享工厂；退出共享是单向的。
    pub fn can_share(&self) -> bool {
        self.core().state.lock().can_share
    }

    /// 工厂引用是否已释放。
    pub fn factory_released(&self) -> bool {
        self.core().state.lock().factory_released
    }

    /// 本代理的释放是否恰为工厂的最后一个引用。
    pub fn released_last_reference(&self) -> bool {
        self.core().state.lock().released_last_ref
    }

    pub async fn open(&self) -> Result<()> {
        self.object.open().await
    }

    pub async fn open_with_timeout(&self, timeout: Duration) -> Result<()> {
        self.object.open_with_timeout(timeout).await
    }

    pub async fn close(&self) -> Result<()> {
        self.object.close().await
    }

    pub async fn close_with_timeout(&self, timeout: Duration) -> Result<()> {
        self.object.close_with_timeout(timeout).await
    }

    pub fn abort(&self) {
        self.object.abort();
    }

    /// 本代理唯一的通道；代理尚未打开时按默认超时隐式打开。
    pub async fn channel(&self) -> Result<Arc<ServiceChannel>> {
        self.object.ensure_opened(self.object.timeouts().open).await?;
        self.core()
            .current_channel()
            .ok_or_else(|| ChannelError::for_state(&self.core().label, "channel", self.state()))
    }

    /// 取得通道工厂以便定制（凭据、行为等）。
    ///
    /// `Default` 策略下，在共享定型（首个通道创建）之前调用会使本代理永久退出共享；
    /// 若此前已拿到缓存工厂，会换成一个私有工厂。`AlwaysOn` 策略下不影响共享。
    pub async fn factory_mut_access(&self) -> Result<Arc<ChannelFactory>> {
        let core = self.core();
        let _gate = core.channel_gate.lock().await;
        match self.state() {
            CommunicationState::Created | CommunicationState::Opened => {}
            state => {
                return Err(ChannelError::for_state(&core.label, "factory_mut_access", state));
            }
        }

        // 缓存工厂只在 Open 期间装入：成功即定型共享，失败则代理进入 `Faulted` 并已在上面被拒绝。
        let (existing, can_share) = {
            let mut state = core.state.lock();
            if !state.sharing_finalized && core.setting == CacheSetting::Default {
                state.can_share = false;
                state.sharing_finalized = true;
            }
            (state.factory.clone(), state.can_share)
        };

        let factory = match existing {
            Some(factory) => factory,
            None => {
                let (factory, cached) = match can_share.then(|| core.domain.cache().lookup(&core.endpoint)) {
                    Some(Some(hit)) => (hit, true),
                    _ => (core.build_private()?, false),
                };
                core.install(&factory, cached)?;
                factory
            }
        };
        Ok(Arc::clone(factory.factory()))
    }

    pub fn open_blocking(&self) -> Result<()> {
        self.object.open_blocking()
    }

    pub fn close_blocking(&self) -> Result<()> {
        self.object.close_blocking()
    }

    pub fn channel_blocking(&self) -> Result<Arc<ServiceChannel>> {
        futures::executor::block_on(self.channel())
    }
}

impl<C: ServiceContract> Drop for ClientProxy<C> {
    fn drop(&mut self) {
        self.object.abort();
    }
}

impl<C: ServiceContract> fmt::Debug for ClientProxy<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientProxy")
            .field("endpoint", &self.core().endpoint)
            .field("state", &self.state())
            .field("setting", &self.core().setting)
            .field("shares_factory", &self.shares_factory())
            .finish()
    }
}
