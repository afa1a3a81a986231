//! # instance：服务端实例上下文与空闲自动关闭
//!
//! ## 核心意图（Why）
//! - 实例上下文拥有一个用户服务对象及绑定到它的通道，分发器在每次入站调用前后通知它；
//! - 当上下文变为空闲且托管模式允许卸载时，它通过与显式调用者完全相同的 Close 路径关闭自己，
//!   空闲关闭与显式关闭可以安全并发，且彼此幂等。
//!
//! ## 行为契约（What）
//! - [`InstanceContext::begin_dispatch`] 递增忙碌计数并返回 [`DispatchTicket`]；
//!   [`InstanceContext::end_dispatch`] 消耗票据、递减计数并在空闲时触发关闭；
//! - 空闲判定：`PerCall` 每次分发结束即卸载；`PerSession` 在忙碌为零且不再绑定通道时卸载；
//!   `Single` 从不自动关闭；`set_auto_close(false)` 关闭所有模式下的自动卸载；
//! - 一旦空闲关闭开始，新的分发与绑定被拒绝；
//! - 关闭先关闭绑定的通道（自有资源优先），再释放用户对象；中止则中止通道并释放用户对象。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::channel::{ChannelId, ServiceChannel};
use crate::config::ChannelSettings;
use crate::error::{ChannelError, Result};
use crate::lifecycle::{CommunicationObject, DefaultTimeouts, LifecycleHooks};
use crate::observability::instance as keys;
use crate::state::CommunicationState;
use crate::time::TimeoutBudget;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// 用户对象的托管模式。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstanceContextMode {
    /// 每次调用一个实例，分发结束即卸载。
    PerCall,
    /// 每个会话一个实例，会话通道全部解绑且空闲时卸载。
    PerSession,
    /// 进程级单例，从不自动卸载。
    Single,
}

impl InstanceContextMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            InstanceContextMode::PerCall => "per_call",
            InstanceContextMode::PerSession => "per_session",
            InstanceContextMode::Single => "single",
        }
    }
}

/// 一次入站分发的凭据，必须交还给签发它的 [`InstanceContext::end_dispatch`]。
#[must_use = "a dispatch ticket must be returned through `end_dispatch`"]
#[derive(Debug)]
pub struct DispatchTicket {
    context: u64,
}

struct Slot<T> {
    instance: Option<Arc<T>>,
    busy: usize,
    channels: Vec<Arc<ServiceChannel>>,
    auto_close: bool,
    idle_closing: bool,
}

/// 实例上下文的生命周期钩子。
pub struct InstanceCore<T> {
    mode: InstanceContextMode,
    slot: Mutex<Slot<T>>,
}

impl<T> InstanceCore<T> {
    fn take_resources(&self) -> (Vec<Arc<ServiceChannel>>, Option<Arc<T>>) {
        let mut slot = self.slot.lock();
        (std::mem::take(&mut slot.channels), slot.instance.take())
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> LifecycleHooks for InstanceCore<T> {
    async fn on_open(&self, _budget: &TimeoutBudget) -> Result<()> {
        Ok(())
    }

    async fn on_close(&self, budget: &TimeoutBudget) -> Result<()> {
        let (channels, instance) = self.take_resources();
        let mut first_error = None;
        for channel in channels {
            let outcome = match budget.remaining_for("instance.channel.close") {
                Ok(remaining) => channel.close_with_timeout(remaining).await,
                Err(err) => {
                    channel.abort();
                    Err(err)
                }
            };
            if let Err(err) = outcome {
                warn!(channel = %channel.id(), error = %err, "bound channel failed to close");
                first_error.get_or_insert(err);
            }
        }
        drop(instance);
        first_error.map_or(Ok(()), Err)
    }

    fn on_abort(&self) {
        let (channels, _instance) = self.take_resources();
        for channel in channels {
            channel.abort();
        }
    }
}

/// 服务端实例上下文。
///
/// # 教案式说明
/// - **意图 (Why)**：把“用户对象何时可以释放”交给忙碌计数与绑定通道共同决定，
///   分发器不必自行追踪；
/// - **契约 (What)**：所有方法可在任意线程并发调用；空闲关闭与显式 [`InstanceContext::close`]
///   共享同一生命周期引擎，重复关闭是无操作；
/// - **风险 (Trade-offs)**：票据未交还会让上下文永远忙碌，分发器必须在调用完成（含失败）后
///   调用 `end_dispatch`。
pub struct InstanceContext<T> {
    id: u64,
    object: CommunicationObject<InstanceCore<T>>,
}

impl<T: Send + Sync + 'static> InstanceContext<T> {
    pub fn new(mode: InstanceContextMode, instance: T) -> Self {
        Self::with_settings(mode, instance, &ChannelSettings::default())
    }

    pub fn with_settings(mode: InstanceContextMode, instance: T, settings: &ChannelSettings) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let core = InstanceCore {
            mode,
            slot: Mutex::new(Slot {
                instance: Some(Arc::new(instance)),
                busy: 0,
                channels: Vec::new(),
                auto_close: true,
                idle_closing: false,
            }),
        };
        Self {
            id,
            object: CommunicationObject::new(format!("instance-{id}:{}", mode.as_str()), core)
                .with_timeouts(DefaultTimeouts::from_settings(settings)),
        }
    }

    pub fn mode(&self) -> InstanceContextMode {
        self.object.hooks().mode
    }

    pub fn state(&self) -> CommunicationState {
        self.object.state()
    }

    pub fn lifecycle(&self) -> &CommunicationObject<InstanceCore<T>> {
        &self.object
    }

    pub fn busy_count(&self) -> usize {
        self.object.hooks().slot.lock().busy
    }

    pub fn channel_count(&self) -> usize {
        self.object.hooks().slot.lock().channels.len()
    }

    pub fn auto_close(&self) -> bool {
        self.object.hooks().slot.lock().auto_close
    }

    /// 启用或禁用空闲自动关闭。
    pub fn set_auto_close(&self, enabled: bool) {
        self.object.hooks().slot.lock().auto_close = enabled;
    }

    /// 用户对象；上下文关闭或中止后返回 `Disposed`。
    pub fn instance(&self) -> Result<Arc<T>> {
        let instance = self.object.hooks().slot.lock().instance.clone();
        instance.ok_or_else(|| ChannelError::for_state(self.object.label(), "instance", CommunicationState::Closed))
    }

    pub async fn open(&self) -> Result<()> {
        self.object.open().await
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

    pub fn open_blocking(&self) -> Result<()> {
        self.object.open_blocking()
    }

    pub fn close_blocking(&self) -> Result<()> {
        self.object.close_blocking()
    }

    /// 登记一次入站分发。
    pub fn begin_dispatch(&self) -> Result<DispatchTicket> {
        self.object.ensure_usable("dispatch")?;
        let mut slot = self.object.hooks().slot.lock();
        if slot.idle_closing {
            return Err(ChannelError::for_state(
                self.object.label(),
                "dispatch",
                CommunicationState::Closing,
            ));
        }
        slot.busy += 1;
        Ok(DispatchTicket { context: self.id })
    }

    /// 完成一次分发；返回上下文是否因此空闲关闭。
    pub async fn end_dispatch(&self, ticket: DispatchTicket) -> Result<bool> {
        if ticket.context != self.id {
            return Err(ChannelError::argument_invalid(format!(
                "dispatch ticket belongs to instance-{} not {}",
                ticket.context,
                self.object.label()
            )));
        }
        let idle = {
            let mut slot = self.object.hooks().slot.lock();
            debug_assert!(slot.busy > 0, "end_dispatch without a matching begin_dispatch");
            slot.busy = slot.busy.saturating_sub(1);
            self.claim_idle_close(&mut slot)
        };
        self.close_if_idle(idle).await
    }

    /// 分发器通知：通道绑定到本上下文。
    pub fn bind_channel(&self, channel: Arc<ServiceChannel>) -> Result<()> {
        self.object.ensure_usable("bind_channel")?;
        let mut slot = self.object.hooks().slot.lock();
        if slot.idle_closing {
            return Err(ChannelError::for_state(
                self.object.label(),
                "bind_channel",
                CommunicationState::Closing,
            ));
        }
        slot.channels.push(channel);
        Ok(())
    }

    /// 分发器通知：通道解除绑定；返回上下文是否因此空闲关闭。
    ///
    /// 解绑的通道交还给分发器，本上下文不会关闭它。
    pub async fn unbind_channel(&self, id: ChannelId) -> Result<bool> {
        let idle = {
            let mut slot = self.object.hooks().slot.lock();
            let before = slot.channels.len();
            slot.channels.retain(|channel| channel.id() != id);
            if slot.channels.len() == before {
                return Ok(false);
            }
            self.claim_idle_close(&mut slot)
        };
        self.close_if_idle(idle).await
    }

    /// 判定是否空闲；若是则在同一临界区内抢占空闲关闭权。
    fn claim_idle_close(&self, slot: &mut Slot<T>) -> bool {
        let unloadable = match self.mode() {
            InstanceContextMode::PerCall => true,
            InstanceContextMode::PerSession => slot.channels.is_empty(),
            InstanceContextMode::Single => false,
        };
        let idle = unloadable
            && slot.auto_close
            && slot.busy == 0
            && !slot.idle_closing
            && self.state() == CommunicationState::Opened;
        if idle {
            slot.idle_closing = true;
        }
        idle
    }

    async fn close_if_idle(&self, idle: bool) -> Result<bool> {
        if !idle {
            return Ok(false);
        }
        debug!(
            { keys::FIELD_MODE } = self.mode().as_str(),
            { keys::FIELD_BUSY } = 0_u64,
            { keys::FIELD_CHANNELS } = self.channel_count() as u64,
            "instance context idle, closing"
        );
        self.object.close().await?;
        Ok(true)
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for InstanceContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceContext")
            .field("id", &self.id)
            .field("mode", &self.object.hooks().mode)
            .field("object", &self.object)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transport::{ChannelShape, TransportChannel};
    use futures::executor::block_on;
    use std::sync::atomic::AtomicUsize;

    struct CountingTransport {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TransportChannel for CountingTransport {
        fn shape(&self) -> ChannelShape {
            ChannelShape::Duplex
        }

        async fn open(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        async fn close(&self, _timeout: Duration) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn abort(&self) {}
    }

    fn opened_channel(closes: &Arc<AtomicUsize>) -> Arc<ServiceChannel> {
        let channel = ServiceChannel::accepted(
            Box::new(CountingTransport {
                closes: Arc::clone(closes),
            }),
            &ChannelSettings::default(),
        );
        block_on(channel.open()).unwrap();
        Arc::new(channel)
    }

    #[test]
    fn per_session_closes_after_last_dispatch_and_unbind() {
        let context = InstanceContext::new(InstanceContextMode::PerSession, String::from("svc"));
        context.open_blocking().unwrap();
        let closes = Arc::new(AtomicUsize::new(0));
        let channel = opened_channel(&closes);
        context.bind_channel(Arc::clone(&channel)).unwrap();

        let ticket = context.begin_dispatch().unwrap();
        assert_eq!(context.busy_count(), 1);
        assert!(!block_on(context.end_dispatch(ticket)).unwrap());
        assert_eq!(context.state(), CommunicationState::Opened);

        assert!(block_on(context.unbind_channel(channel.id())).unwrap());
        assert_eq!(context.state(), CommunicationState::Closed);
        // 已解绑的通道归分发器所有，不随上下文关闭。
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        assert_eq!(context.instance().unwrap_err().kind(), ErrorKind::Disposed);
    }

    #[test]
    fn per_call_unloads_after_every_dispatch() {
        let context = InstanceContext::new(InstanceContextMode::PerCall, 7_u32);
        context.open_blocking().unwrap();
        let ticket = context.begin_dispatch().unwrap();
        assert_eq!(*context.instance().unwrap(), 7);
        assert!(block_on(context.end_dispatch(ticket)).unwrap());
        assert_eq!(context.state(), CommunicationState::Closed);
        assert_eq!(context.begin_dispatch().unwrap_err().kind(), ErrorKind::Disposed);
    }

    #[test]
    fn single_never_auto_closes() {
        let context = InstanceContext::new(InstanceContextMode::Single, ());
        context.open_blocking().unwrap();
        for _ in 0..3 {
            let ticket = context.begin_dispatch().unwrap();
            assert!(!block_on(context.end_dispatch(ticket)).unwrap());
        }
        assert_eq!(context.state(), CommunicationState::Opened);
    }

    #[test]
    fn disabled_auto_close_keeps_idle_context_open() {
        let context = InstanceContext::new(InstanceContextMode::PerCall, ());
        context.open_blocking().unwrap();
        context.set_auto_close(false);
        let ticket = context.begin_dispatch().unwrap();
        assert!(!block_on(context.end_dispatch(ticket)).unwrap());
        assert_eq!(context.state(), CommunicationState::Opened);
    }

    #[test]
    fn explicit_close_closes_bound_channels_and_releases_instance() {
        let context = InstanceContext::new(InstanceContextMode::PerSession, vec![1, 2, 3]);
        context.open_blocking().unwrap();
        let closes = Arc::new(AtomicUsize::new(0));
        context.bind_channel(opened_channel(&closes)).unwrap();
        context.bind_channel(opened_channel(&closes)).unwrap();
        let ticket = context.begin_dispatch().unwrap();

        context.close_blocking().unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 2);
        assert_eq!(context.channel_count(), 0);
        assert!(context.instance().is_err());

        // 在途分发在关闭之后完成：不会再次关闭，也不会报错。
        assert!(!block_on(context.end_dispatch(ticket)).unwrap());
        context.close_blocking().unwrap();
    }

    #[test]
    fn foreign_tickets_are_rejected() {
        let first = InstanceContext::new(InstanceContextMode::Single, ());
        let second = InstanceContext::new(InstanceContextMode::Single, ());
        first.open_blocking().unwrap();
        second.open_blocking().unwrap();
        let ticket = first.begin_dispatch().unwrap();
        let err = block_on(second.end_dispatch(ticket)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentInvalid);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn idle_close_racing_explicit_close_closes_once() {
        for _ in 0..64 {
            let context = Arc::new(InstanceContext::new(InstanceContextMode::PerCall, ()));
            context.open().await.unwrap();
            let closes = Arc::new(AtomicUsize::new(0));
            context.bind_channel(opened_channel(&closes)).unwrap();
            let closed_events = Arc::new(AtomicUsize::new(0));
            let sink = Arc::clone(&closed_events);
            context.lifecycle().subscribe(Arc::new(move |event| {
                if event == crate::state::LifecycleEvent::Closed {
                    sink.fetch_add(1, Ordering::SeqCst);
                }
            }));
            let ticket = context.begin_dispatch().unwrap();

            let idle = tokio::spawn({
                let context = Arc::clone(&context);
                async move { context.end_dispatch(ticket).await }
            });
            let explicit = tokio::spawn({
                let context = Arc::clone(&context);
                async move { context.close().await }
            });
            idle.await.unwrap().unwrap();
            explicit.await.unwrap().unwrap();

            assert_eq!(context.state(), CommunicationState::Closed);
            assert_eq!(closed_events.load(Ordering::SeqCst), 1);
            assert_eq!(closes.load(Ordering::SeqCst), 1);
        }
    }
}
