//! # factory：绑定到单一端点的通道工厂
//!
//! ## 核心意图（Why）
//! - 工厂持有传输工厂栈，打开代价高昂，因此会被多个代理共享；
//! - 工厂自身也是生命周期对象：Open/Close/Abort 直接委托给传输工厂，并负责收尾它创建的通道。
//!
//! ## 行为契约（What）
//! - `create_channel` 只能在工厂打开后使用；异步入口会按默认超时隐式打开工厂；
//! - 关闭工厂时先关闭仍存活的通道，再关闭传输工厂（先自有资源、后依赖）；
//! - 中止工厂时中止全部存活通道与传输工厂，不做任何等待。
//!
//! ## 风险提示（Trade-offs）
//! - 工厂只以 `Weak` 记录通道，通道的所有权仍属于代理；已释放的通道会在下次创建时被清理。

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use crate::channel::ServiceChannel;
use crate::config::ChannelSettings;
use crate::endpoint::EndpointDescription;
use crate::error::{ChannelError, Result};
use crate::lifecycle::{CommunicationObject, DefaultTimeouts, LifecycleHooks};
use crate::observability::lifecycle as keys;
use crate::state::CommunicationState;
use crate::time::{SharedClock, TimeoutBudget, system_clock};
use crate::transport::{ChannelShape, TransportFactory};

/// 通道工厂的生命周期钩子。
pub struct FactoryCore {
    transport: Arc<dyn TransportFactory>,
    channels: Mutex<Vec<Weak<ServiceChannel>>>,
}

impl FactoryCore {
    fn live_channels(&self) -> Vec<Arc<ServiceChannel>> {
        let mut channels = self.channels.lock();
        channels.retain(|weak| weak.strong_count() > 0);
        channels.iter().filter_map(Weak::upgrade).collect()
    }

    fn drain_channels(&self) -> Vec<Arc<ServiceChannel>> {
        let drained: Vec<_> = self.channels.lock().drain(..).collect();
        drained.iter().filter_map(Weak::upgrade).collect()
    }
}

#[async_trait]
impl LifecycleHooks for FactoryCore {
    async fn on_open(&self, budget: &TimeoutBudget) -> Result<()> {
        let remaining = budget.remaining_for("transport.factory.open")?;
        self.transport.open(remaining).await
    }

    async fn on_close(&self, budget: &TimeoutBudget) -> Result<()> {
        let mut first_error = None;
        for channel in self.drain_channels() {
            let outcome = match budget.remaining_for("factory.channel.close") {
                Ok(remaining) => channel.close_with_timeout(remaining).await,
                Err(err) => {
                    channel.abort();
                    Err(err)
                }
            };
            if let Err(err) = outcome {
                warn!(channel = %channel.id(), error = %err, "channel close failed during factory close");
                first_error.get_or_insert(err);
            }
        }

        let transport = match budget.remaining_for("transport.factory.close") {
            Ok(remaining) => self.transport.close(remaining).await,
            Err(err) => Err(err),
        };
        match (first_error, transport) {
            (_, Err(err)) => Err(err),
            (Some(err), Ok(())) => Err(err),
            (None, Ok(())) => Ok(()),
        }
    }

    fn on_abort(&self) {
        for channel in self.drain_channels() {
            channel.abort();
        }
        self.transport.abort();
    }
}

/// 绑定到一个已解析端点的通道工厂。
pub struct ChannelFactory {
    description: EndpointDescription,
    object: CommunicationObject<FactoryCore>,
}

impl ChannelFactory {
    /// 按配置构造工厂，使用系统时钟。
    pub fn new(description: EndpointDescription, settings: &ChannelSettings) -> Result<Self> {
        Self::with_clock(description, settings, system_clock())
    }

    /// 按配置构造工厂，并注入时钟。
    ///
    /// 传输工厂由绑定在此处构造；绑定的参数校验错误原样返回，不会被吞掉。
    pub fn with_clock(
        description: EndpointDescription,
        settings: &ChannelSettings,
        clock: SharedClock,
    ) -> Result<Self> {
        settings.validate()?;
        let transport = description.binding().build_factory(&description)?;
        let label = format!(
            "factory:{}@{}",
            description.contract().as_str(),
            description.address()
        );
        let object = CommunicationObject::new(
            label,
            FactoryCore {
                transport,
                channels: Mutex::new(Vec::new()),
            },
        )
        .with_timeouts(DefaultTimeouts::from_settings(settings))
        .with_clock(clock);
        Ok(Self {
            description,
            object,
        })
    }

    pub fn description(&self) -> &EndpointDescription {
        &self.description
    }

    pub fn lifecycle(&self) -> &CommunicationObject<FactoryCore> {
        &self.object
    }

    pub fn state(&self) -> CommunicationState {
        self.object.state()
    }

    pub async fn open(&self) -> Result<()> {
        self.object.open().await
    }

    pub async fn open_with_timeout(&self, timeout: Duration) -> Result<()> {
        self.object.open_with_timeout(timeout).await
    }

    pub async fn ensure_opened(&self, timeout: Duration) -> Result<()> {
        self.object.ensure_opened(timeout).await
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

    /// 创建通道；工厂尚未打开时按默认超时隐式打开。
    pub async fn create_channel(&self, shape: ChannelShape) -> Result<Arc<ServiceChannel>> {
        self.object.ensure_opened(self.object.timeouts().open).await?;
        self.create_channel_opened(shape)
    }

    /// 同步调用者的 [`ChannelFactory::create_channel`]。
    pub fn create_channel_blocking(&self, shape: ChannelShape) -> Result<Arc<ServiceChannel>> {
        futures::executor::block_on(self.create_channel(shape))
    }

    /// 在已打开的工厂上创建通道，不做隐式打开。
    pub(crate) fn create_channel_opened(&self, shape: ChannelShape) -> Result<Arc<ServiceChannel>> {
        self.object.ensure_usable("create_channel")?;
        if !self.description.binding().supports(shape) {
            return Err(ChannelError::argument_invalid(format!(
                "binding `{}` does not support {shape} channels",
                self.description.binding().identity().name()
            )));
        }
        let core = self.object.hooks();
        let transport = core
            .transport
            .create_channel(shape, self.description.address())?;
        let channel = Arc::new(ServiceChannel::new(
            transport,
            self.object.timeouts(),
            Arc::clone(self.object.clock()),
        ));
        core.channels.lock().push(Arc::downgrade(&channel));

        // 登记与关闭之间存在窗口：若此时工厂已离开 Opened，通道不会被关闭流程看见，必须就地中止。
        if let Err(err) = self.object.ensure_usable("create_channel") {
            channel.abort();
            return Err(err);
        }
        tracing::trace!(
            { keys::FIELD_LABEL } = self.object.label(),
            channel = %channel.id(),
            "channel created"
        );
        Ok(channel)
    }

    /// 仍存活的通道数量。
    pub fn channel_count(&self) -> usize {
        self.object.hooks().live_channels().len()
    }
}

impl fmt::Debug for ChannelFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelFactory")
            .field("description", &self.description)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{BindingId, ContractId, EndpointAddress};
    use crate::error::ErrorKind;
    use crate::transport::{Binding, TransportChannel};
    use futures::executor::block_on;

    type Journal = Arc<Mutex<Vec<&'static str>>>;

    struct Recording {
        journal: Journal,
    }

    #[async_trait]
    impl TransportChannel for Recording {
        fn shape(&self) -> ChannelShape {
            ChannelShape::RequestReply
        }

        async fn open(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        async fn close(&self, _timeout: Duration) -> Result<()> {
            self.journal.lock().push("channel.close");
            Ok(())
        }

        fn abort(&self) {
            self.journal.lock().push("channel.abort");
        }
    }

    #[async_trait]
    impl TransportFactory for Recording {
        async fn open(&self, _timeout: Duration) -> Result<()> {
            self.journal.lock().push("factory.open");
            Ok(())
        }

        async fn close(&self, _timeout: Duration) -> Result<()> {
            self.journal.lock().push("factory.close");
            Ok(())
        }

        fn abort(&self) {
            self.journal.lock().push("factory.abort");
        }

        fn create_channel(
            &self,
            _shape: ChannelShape,
            _address: &EndpointAddress,
        ) -> Result<Box<dyn TransportChannel>> {
            Ok(Box::new(Recording {
                journal: Arc::clone(&self.journal),
            }))
        }
    }

    /// 只支持请求-应答的绑定。
    struct RequestReplyOnly {
        journal: Journal,
    }

    impl Binding for RequestReplyOnly {
        fn identity(&self) -> BindingId {
            BindingId::new("recording", "request-reply-only", "")
        }

        fn supports(&self, shape: ChannelShape) -> bool {
            shape == ChannelShape::RequestReply
        }

        fn build_factory(&self, _endpoint: &EndpointDescription) -> Result<Arc<dyn TransportFactory>> {
            Ok(Arc::new(Recording {
                journal: Arc::clone(&self.journal),
            }))
        }
    }

    fn factory() -> (ChannelFactory, Journal) {
        let journal = Journal::default();
        let description = EndpointDescription::new(
            ContractId::new("calc").unwrap(),
            Arc::new(RequestReplyOnly {
                journal: Arc::clone(&journal),
            }),
            EndpointAddress::parse("recording://host/calc".to_owned()).unwrap(),
        );
        let factory = ChannelFactory::new(description, &ChannelSettings::default()).unwrap();
        (factory, journal)
    }

    #[test]
    fn creating_a_channel_opens_a_fresh_factory_first() {
        let (factory, journal) = factory();
        assert_eq!(factory.state(), CommunicationState::Created);

        let channel = factory
            .create_channel_blocking(ChannelShape::RequestReply)
            .unwrap();
        assert_eq!(factory.state(), CommunicationState::Opened);
        assert_eq!(channel.state(), CommunicationState::Created);
        assert_eq!(factory.channel_count(), 1);
        assert_eq!(*journal.lock(), vec!["factory.open"]);
    }

    #[test]
    fn unsupported_shape_is_an_argument_error() {
        let (factory, _journal) = factory();
        let err = factory
            .create_channel_blocking(ChannelShape::Duplex)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentInvalid);
        assert_eq!(factory.channel_count(), 0);
        assert_eq!(factory.state(), CommunicationState::Opened, "rejection does not fault");
    }

    #[test]
    fn closing_the_factory_closes_live_channels_before_the_transport() {
        let (factory, journal) = factory();
        let channel = factory
            .create_channel_blocking(ChannelShape::RequestReply)
            .unwrap();
        block_on(channel.open()).unwrap();

        block_on(factory.close()).unwrap();
        assert_eq!(channel.state(), CommunicationState::Closed);
        assert_eq!(factory.state(), CommunicationState::Closed);
        assert_eq!(
            *journal.lock(),
            vec!["factory.open", "channel.close", "factory.close"]
        );
    }

    #[test]
    fn aborting_the_factory_aborts_live_channels() {
        let (factory, journal) = factory();
        let channel = factory
            .create_channel_blocking(ChannelShape::RequestReply)
            .unwrap();
        block_on(channel.open()).unwrap();

        factory.abort();
        assert_eq!(channel.state(), CommunicationState::Closed);
        assert_eq!(
            *journal.lock(),
            vec!["factory.open", "channel.abort", "factory.abort"]
        );
    }
}
