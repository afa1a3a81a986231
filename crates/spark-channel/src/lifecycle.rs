//! # 生命周期引擎：`CommunicationObject`
//!
//! ## 核心意图（Why）
//! - 通道工厂、通道、客户端代理与实例上下文都需要完全一致的 Open/Close/Abort/Fault 语义；
//!   把状态机与加锁逻辑集中在一个引擎里，具体资源只实现 [`LifecycleHooks`]；
//! - 任意线程都可能并发调用生命周期方法，引擎保证“恰好一次”的打开与关闭。
//!
//! ## 结构（How）
//! - `inner`：短临界区的 `parking_lot::Mutex`，保护状态、中止标记与事件位图；
//! - `peek`：状态的原子镜像，供 `ensure_opened` 等热路径做无锁窥视（double-checked）；
//! - `operation`：跨 `.await` 持有的 `tokio::sync::Mutex`，串行化 Open/Close，
//!   使第二个并发 Close 阻塞到第一个完成；该锁与运行时无关，阻塞式入口同样可用；
//! - `abort` 从不获取 `operation`，因此即使另一线程仍停在 `on_open`/`on_close` 中也能立即返回；
//! - `delivery`：可重入锁，串行化事件投递，订阅者因此按状态迁移的顺序收到事件。
//!
//! ## 契约（What）
//! - `Created` 状态下的 Close 走中止路径：不调用 `on_close`，只调用 `on_abort` 释放资源；
//! - `on_open` 失败会使对象进入 `Faulted` 并原样返回错误；
//! - `on_close` 失败会先中止对象（记账先于报错），再返回错误；
//! - 对 `Faulted` 对象调用 Close 会执行一次 `on_abort` 拆除资源，然后报告 `Faulted` 错误。
//!
//! ## 风险提示（Trade-offs）
//! - 等待 `operation` 锁同样消耗本次预算：额度先耗尽的等待者返回 `Timeout`，不改变对象状态，
//!   持锁方的 Open/Close 照常完成；
//! - 对象进入终态后，尚未投递的 `Opening`/`Opened`/`Closing` 事件会被丢弃而不是迟到。

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::{debug, warn};

use crate::config::ChannelSettings;
use crate::error::{ChannelError, Result};
use crate::observability::lifecycle as keys;
use crate::state::{CommunicationState, LifecycleEvent};
use crate::time::{SharedClock, TimeoutBudget, system_clock};

/// 具体资源向引擎提供的生命周期钩子。
///
/// # 教案式说明
/// - **意图 (Why)**：以组合代替继承的“模板方法”：引擎拥有状态与锁，资源只描述打开/关闭/中止
///   时要做的事情；
/// - **契约 (What)**：
///   - `on_open`/`on_close` 接收本次调用的 [`TimeoutBudget`]，嵌套子操作必须通过
///     [`TimeoutBudget::remaining_for`] 领取剩余额度；
///   - `on_abort` 不得阻塞、不得失败，且必须能在从未打开或正在中止的对象上安全调用；
///   - 迁移回调在对应事件首次触发时调用一次，默认空实现；
/// - **风险 (Trade-offs)**：迁移回调在引擎锁外执行，可以回调引擎的只读方法或 `abort`，
///   但不应在回调内同步等待 Open/Close 完成。
#[async_trait]
pub trait LifecycleHooks: Send + Sync + 'static {
    async fn on_open(&self, budget: &TimeoutBudget) -> Result<()>;

    async fn on_close(&self, budget: &TimeoutBudget) -> Result<()>;

    fn on_abort(&self);

    fn on_opening(&self) {}

    fn on_opened(&self) {}

    fn on_closing(&self) {}

    fn on_closed(&self) {}

    fn on_faulted(&self) {}
}

/// 生命周期事件的外部订阅者。
pub type LifecycleListener = Arc<dyn Fn(LifecycleEvent) + Send + Sync>;

/// Open/Close 的默认超时。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DefaultTimeouts {
    pub open: Duration,
    pub close: Duration,
}

impl DefaultTimeouts {
    pub fn from_settings(settings: &ChannelSettings) -> Self {
        Self {
            open: settings.open_timeout,
            close: settings.close_timeout,
        }
    }
}

impl Default for DefaultTimeouts {
    fn default() -> Self {
        Self::from_settings(&ChannelSettings::default())
    }
}

#[derive(Debug)]
struct Inner {
    state: CommunicationState,
    aborted: bool,
    torn_down: bool,
    fired: u8,
}

/// 通用生命周期状态机。
///
/// 资源类型以 `CommunicationObject<MyHooks>` 组合本引擎，并通过 [`CommunicationObject::hooks`]
/// 访问自身状态。
pub struct CommunicationObject<H> {
    hooks: H,
    label: Cow<'static, str>,
    peek: AtomicU8,
    inner: Mutex<Inner>,
    operation: AsyncMutex<()>,
    timeouts: DefaultTimeouts,
    clock: SharedClock,
    listeners: Mutex<Vec<LifecycleListener>>,
    delivery: ReentrantMutex<()>,
}

impl<H: LifecycleHooks> CommunicationObject<H> {
    /// 以默认超时与系统时钟构造处于 `Created` 的对象。
    pub fn new(label: impl Into<Cow<'static, str>>, hooks: H) -> Self {
        Self {
            hooks,
            label: label.into(),
            peek: AtomicU8::new(CommunicationState::Created as u8),
            inner: Mutex::new(Inner {
                state: CommunicationState::Created,
                aborted: false,
                torn_down: false,
                fired: 0,
            }),
            operation: AsyncMutex::new(()),
            timeouts: DefaultTimeouts::default(),
            clock: system_clock(),
            listeners: Mutex::new(Vec::new()),
            delivery: ReentrantMutex::new(()),
        }
    }

    pub fn with_timeouts(mut self, timeouts: DefaultTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn timeouts(&self) -> DefaultTimeouts {
        self.timeouts
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// 无锁读取当前状态。
    pub fn state(&self) -> CommunicationState {
        CommunicationState::from_u8(self.peek.load(Ordering::Acquire))
    }

    /// 订阅生命周期事件；只会收到订阅之后发生的事件。
    pub fn subscribe(&self, listener: LifecycleListener) {
        self.listeners.lock().push(listener);
    }

    /// 以默认打开超时执行 [`CommunicationObject::open_with_timeout`]。
    pub async fn open(&self) -> Result<()> {
        self.open_with_timeout(self.timeouts.open).await
    }

    /// 打开对象。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：只有第一个观察到 `Created` 的调用者执行 `on_open`；并发者等待其完成，
    ///   若对象已 `Opened` 则直接成功；`Faulted`/`Closed` 对象立即失败且不调用钩子；
    /// - **执行 (How)**：
    ///   1. 在入口计算一次预算并做无锁快路径检查；
    ///   2. 在剩余预算内取得 `operation` 锁，再在 `inner` 锁内推进 `Created → Opening`；
    ///   3. 锁外触发 `Opening`，领取剩余额度并调用 `on_open`；
    ///   4. 成功时若状态仍为 `Opening` 则推进到 `Opened`，否则说明期间被中止或故障。
    pub async fn open_with_timeout(&self, timeout: Duration) -> Result<()> {
        let budget = TimeoutBudget::start(Arc::clone(&self.clock), timeout);
        match self.state() {
            CommunicationState::Opened => return Ok(()),
            state @ (CommunicationState::Closing
            | CommunicationState::Closed
            | CommunicationState::Faulted) => {
                return Err(ChannelError::for_state(&self.label, "open", state));
            }
            CommunicationState::Created | CommunicationState::Opening => {}
        }

        let _operation = self.acquire_operation(&budget).await?;
        {
            let mut inner = self.inner.lock();
            match inner.state {
                CommunicationState::Created => {
                    self.set_state(&mut inner, CommunicationState::Opening)
                }
                CommunicationState::Opened => return Ok(()),
                state => return Err(ChannelError::for_state(&self.label, "open", state)),
            }
        }
        self.fire(LifecycleEvent::Opening);

        let result = match budget.remaining_for(&self.label) {
            Ok(remaining) => {
                let budget_ms = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX);
                debug!(
                    { keys::FIELD_LABEL } = %self.label,
                    { keys::FIELD_BUDGET_MS } = budget_ms,
                    "opening communication object"
                );
                self.hooks.on_open(&budget).await
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                let opened = {
                    let mut inner = self.inner.lock();
                    if inner.state == CommunicationState::Opening {
                        self.set_state(&mut inner, CommunicationState::Opened);
                        true
                    } else {
                        false
                    }
                };
                if opened {
                    self.fire(LifecycleEvent::Opened);
                    Ok(())
                } else {
                    Err(self.preempted_error("open"))
                }
            }
            Err(err) => {
                warn!(
                    { keys::FIELD_LABEL } = %self.label,
                    error = %err,
                    "open failed, faulting communication object"
                );
                self.fault();
                Err(err)
            }
        }
    }

    /// 以默认关闭超时执行 [`CommunicationObject::close_with_timeout`]。
    pub async fn close(&self) -> Result<()> {
        self.close_with_timeout(self.timeouts.close).await
    }

    /// 优雅关闭对象，幂等。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - `Opened`：`Opened → Closing`，调用 `on_close`，再 `Closing → Closed`；
    ///   - `Created`：走中止路径直接进入 `Closed`，不调用 `on_close`；
    ///   - `Closed`：立即成功；
    ///   - `Faulted`：拆除资源后返回 `Faulted` 错误；
    /// - **并发 (How)**：第二个并发调用者在 `operation` 锁上等待第一个完成，随后观察到 `Closed`
    ///   并直接返回，既不重复执行 `on_close` 也不重复触发 `Closed` 事件；若等待期间自身预算耗尽，
    ///   则返回 `Timeout`，第一个调用者不受影响。
    pub async fn close_with_timeout(&self, timeout: Duration) -> Result<()> {
        let budget = TimeoutBudget::start(Arc::clone(&self.clock), timeout);
        if self.state() == CommunicationState::Closed {
            return Ok(());
        }

        let _operation = self.acquire_operation(&budget).await?;
        let state = {
            let mut inner = self.inner.lock();
            let state = inner.state;
            if state == CommunicationState::Opened {
                self.set_state(&mut inner, CommunicationState::Closing);
            }
            state
        };

        match state {
            CommunicationState::Closed => Ok(()),
            CommunicationState::Created => {
                self.abort();
                Ok(())
            }
            CommunicationState::Faulted => {
                self.abort();
                Err(ChannelError::for_state(&self.label, "close", state))
            }
            CommunicationState::Opened => self.run_close(&budget).await,
            // 持有 `operation` 锁时不会观察到中间态。
            CommunicationState::Opening | CommunicationState::Closing => {
                Err(ChannelError::for_state(&self.label, "close", state))
            }
        }
    }

    async fn run_close(&self, budget: &TimeoutBudget) -> Result<()> {
        self.fire(LifecycleEvent::Closing);
        let result = match budget.remaining_for(&self.label) {
            Ok(_) => self.hooks.on_close(budget).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                let closed = {
                    let mut inner = self.inner.lock();
                    if inner.state == CommunicationState::Closing {
                        inner.torn_down = true;
                        self.set_state(&mut inner, CommunicationState::Closed);
                        true
                    } else {
                        false
                    }
                };
                if closed {
                    self.fire(LifecycleEvent::Closed);
                }
                Ok(())
            }
            Err(err) => {
                warn!(
                    { keys::FIELD_LABEL } = %self.label,
                    error = %err,
                    "close failed, aborting communication object"
                );
                self.abort();
                Err(err)
            }
        }
    }

    /// 强制中止：无条件、幂等、从不失败、从不等待 Open/Close。
    ///
    /// 非终态被推进到 `Closed`；`Faulted` 保持不变但资源仍通过 `on_abort` 拆除一次。
    pub fn abort(&self) {
        let transitioned = {
            let mut inner = self.inner.lock();
            if inner.torn_down {
                return;
            }
            inner.torn_down = true;
            inner.aborted = true;
            if inner.state.is_terminal() {
                false
            } else {
                self.set_state(&mut inner, CommunicationState::Closed);
                true
            }
        };
        debug!({ keys::FIELD_LABEL } = %self.label, "aborting communication object");
        self.hooks.on_abort();
        if transitioned {
            self.fire(LifecycleEvent::Closed);
        }
    }

    /// 把任意非终态推进到 `Faulted`，只生效一次。
    pub fn fault(&self) {
        let changed = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                false
            } else {
                self.set_state(&mut inner, CommunicationState::Faulted);
                true
            }
        };
        if changed {
            self.fire(LifecycleEvent::Faulted);
        }
    }

    /// 确保对象已打开：`Opened` 时走无锁快路径，否则执行完整的 Open。
    pub async fn ensure_opened(&self, timeout: Duration) -> Result<()> {
        if self.state() == CommunicationState::Opened {
            return Ok(());
        }
        self.open_with_timeout(timeout).await
    }

    /// 要求对象处于 `Opened`，否则按状态返回对应分类的错误。
    pub fn ensure_usable(&self, operation: &'static str) -> Result<()> {
        match self.state() {
            CommunicationState::Opened => Ok(()),
            state => Err(ChannelError::for_state(&self.label, operation, state)),
        }
    }

    /// 同步调用者的 Open 入口。
    ///
    /// 在当前线程驱动 Future 直至完成；不要在异步运行时的工作线程上调用。
    pub fn open_blocking(&self) -> Result<()> {
        futures::executor::block_on(self.open())
    }

    pub fn open_blocking_with_timeout(&self, timeout: Duration) -> Result<()> {
        futures::executor::block_on(self.open_with_timeout(timeout))
    }

    /// 同步调用者的 Close 入口。
    pub fn close_blocking(&self) -> Result<()> {
        futures::executor::block_on(self.close())
    }

    /// 在本次预算内取得 `operation` 锁；无竞争时不启动计时。
    async fn acquire_operation(&self, budget: &TimeoutBudget) -> Result<AsyncMutexGuard<'_, ()>> {
        match self.operation.try_lock() {
            Ok(guard) => Ok(guard),
            Err(_) => budget.bound(&self.label, self.operation.lock()).await,
        }
    }

    fn preempted_error(&self, operation: &'static str) -> ChannelError {
        let inner = self.inner.lock();
        if inner.aborted && inner.state == CommunicationState::Closed {
            ChannelError::aborted(&self.label)
        } else {
            ChannelError::for_state(&self.label, operation, inner.state)
        }
    }

    fn set_state(&self, inner: &mut Inner, next: CommunicationState) {
        debug_assert!(
            inner.state.can_transition_to(next),
            "illegal transition {} -> {next}",
            inner.state
        );
        inner.state = next;
        self.peek.store(next as u8, Ordering::Release);
    }

    fn fire(&self, event: LifecycleEvent) {
        let _delivery = self.delivery.lock();
        {
            let mut inner = self.inner.lock();
            if inner.fired & event.bit() != 0 {
                return;
            }
            let terminal_event = matches!(event, LifecycleEvent::Closed | LifecycleEvent::Faulted);
            if !terminal_event && inner.state.is_terminal() {
                return;
            }
            inner.fired |= event.bit();
        }
        debug!(
            { keys::FIELD_LABEL } = %self.label,
            { keys::FIELD_EVENT } = event.as_str(),
            { keys::FIELD_STATE } = self.state().as_str(),
            "lifecycle transition"
        );
        match event {
            LifecycleEvent::Opening => self.hooks.on_opening(),
            LifecycleEvent::Opened => self.hooks.on_opened(),
            LifecycleEvent::Closing => self.hooks.on_closing(),
            LifecycleEvent::Closed => self.hooks.on_closed(),
            LifecycleEvent::Faulted => self.hooks.on_faulted(),
        }
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener(event);
        }
    }
}

impl<H> fmt::Debug for CommunicationObject<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommunicationObject")
            .field("label", &self.label)
            .field(
                "state",
                &CommunicationState::from_u8(self.peek.load(Ordering::Acquire)),
            )
            .finish_non_exhaustive()
    }
}
