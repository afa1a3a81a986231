//! 单个通道的生命周期包装。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::config::ChannelSettings;
use crate::error::Result;
use crate::lifecycle::{CommunicationObject, DefaultTimeouts, LifecycleHooks};
use crate::state::CommunicationState;
use crate::time::{SharedClock, TimeoutBudget, system_clock};
use crate::transport::{ChannelShape, TransportChannel};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// 进程内唯一的通道编号。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// 通道的生命周期钩子：直接委托给传输层通道。
pub struct ChannelCore {
    transport: Box<dyn TransportChannel>,
}

#[async_trait]
impl LifecycleHooks for ChannelCore {
    async fn on_open(&self, budget: &TimeoutBudget) -> Result<()> {
        let remaining = budget.remaining_for("transport.channel.open")?;
        self.transport.open(remaining).await
    }

    async fn on_close(&self, budget: &TimeoutBudget) -> Result<()> {
        let remaining = budget.remaining_for("transport.channel.close")?;
        self.transport.close(remaining).await
    }

    fn on_abort(&self) {
        self.transport.abort();
    }
}

/// 由通道工厂创建、带完整生命周期语义的通道。
///
/// 通道从不在代理之间共享；其生命周期由创建它的代理（或实例上下文）负责。
pub struct ServiceChannel {
    id: ChannelId,
    shape: ChannelShape,
    object: CommunicationObject<ChannelCore>,
}

impl ServiceChannel {
    pub(crate) fn new(
        transport: Box<dyn TransportChannel>,
        timeouts: DefaultTimeouts,
        clock: SharedClock,
    ) -> Self {
        let id = ChannelId::next();
        let shape = transport.shape();
        Self {
            id,
            shape,
            object: CommunicationObject::new(id.to_string(), ChannelCore { transport })
                .with_timeouts(timeouts)
                .with_clock(clock),
        }
    }

    /// 包装分发器接受的服务端传输通道，供 [`crate::InstanceContext::bind_channel`] 绑定。
    pub fn accepted(transport: Box<dyn TransportChannel>, settings: &ChannelSettings) -> Self {
        Self::new(
            transport,
            DefaultTimeouts::from_settings(settings),
            system_clock(),
        )
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn shape(&self) -> ChannelShape {
        self.shape
    }

    pub fn state(&self) -> CommunicationState {
        self.object.state()
    }

    /// 生命周期引擎，可用于订阅事件或调用阻塞式入口。
    pub fn lifecycle(&self) -> &CommunicationObject<ChannelCore> {
        &self.object
    }

    /// 底层传输通道；调用前应确认通道已打开。
    pub fn transport(&self) -> Result<&dyn TransportChannel> {
        self.object.ensure_usable("transport")?;
        Ok(self.object.hooks().transport.as_ref())
    }

    pub async fn open(&self) -> Result<()> {
        self.object.open().await
    }

    pub async fn open_with_timeout(&self, timeout: std::time::Duration) -> Result<()> {
        self.object.open_with_timeout(timeout).await
    }

    pub async fn close(&self) -> Result<()> {
        self.object.close().await
    }

    pub async fn close_with_timeout(&self, timeout: std::time::Duration) -> Result<()> {
        self.object.close_with_timeout(timeout).await
    }

    pub fn abort(&self) {
        self.object.abort();
    }
}

impl fmt::Debug for ServiceChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceChannel")
            .field("id", &self.id)
            .field("shape", &self.shape)
            .field("state", &self.state())
            .finish()
    }
}
