//! 可注入时钟与顺序消耗的超时预算。
//!
//! # 教案式说明
//! - **意图 (Why)**：链式 Open/Close 需要“一次计算、顺序消耗”的超时预算；若直接读取系统时钟，
//!   “第二个子操作恰好拿到 `T - t1`”这类性质无法在 CI 中确定性复现；
//! - **契约 (What)**：[`Clock`] 提供单调的 `now` 与与运行时无关的 `sleep`；[`SystemClock`] 委托
//!   [`Instant::now`] 并以后台线程实现睡眠，[`MockClock`] 由测试手动推进并唤醒到期的睡眠；
//!   [`TimeoutBudget`] 绑定时钟与起点，按需返回剩余额度，并可为一次等待设上限；
//! - **风险 (Trade-offs)**：预算本身不会抢占正在执行的钩子，超时的强制执行由各层钩子
//!   根据收到的剩余额度自行完成；只有“等待他人”的环节由 [`TimeoutBudget::bound`] 直接截断。

use std::fmt;
use std::future::Future;
use std::pin::{Pin, pin};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::{Duration, Instant};

use futures::future::{Either, select};
use parking_lot::{Condvar, Mutex};

use crate::error::{ChannelError, Result};

/// 时钟返回的统一睡眠 Future，不绑定任何运行时。
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// 单调时钟抽象。
///
/// 实现者必须保证 `now` 单调不减，且 `sleep(d)` 在时钟推进 `d` 之后完成。
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration) -> Sleep;
}

/// 系统单调时钟。
///
/// `sleep` 由一个后台线程完成；丢弃睡眠 Future 会立即唤醒并结束该线程。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        let timer = Arc::new(Timer::default());
        let worker = Arc::clone(&timer);
        let deadline = Instant::now().checked_add(duration);
        thread::spawn(move || worker.run_until(deadline));
        Box::pin(TimerFuture { timer })
    }
}

/// 一次睡眠的完成标记与唤醒句柄，系统时钟与虚拟时钟共用。
#[derive(Debug, Default)]
struct Timer {
    state: Mutex<TimerState>,
    cancel: Condvar,
}

#[derive(Debug, Default)]
struct TimerState {
    fired: bool,
    cancelled: bool,
    waker: Option<Waker>,
}

impl Timer {
    fn fire(&self) {
        let waker = {
            let mut state = self.state.lock();
            state.fired = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// 后台线程主体：`deadline` 为 `None` 表示只能被取消。
    fn run_until(&self, deadline: Option<Instant>) {
        {
            let mut state = self.state.lock();
            loop {
                if state.cancelled {
                    return;
                }
                match deadline {
                    Some(deadline) => {
                        if self.cancel.wait_until(&mut state, deadline).timed_out() {
                            break;
                        }
                    }
                    None => self.cancel.wait(&mut state),
                }
            }
            if state.cancelled {
                return;
            }
        }
        self.fire();
    }
}

struct TimerFuture {
    timer: Arc<Timer>,
}

impl Future for TimerFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.timer.state.lock();
        if state.fired {
            return Poll::Ready(());
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for TimerFuture {
    fn drop(&mut self) {
        self.timer.state.lock().cancelled = true;
        self.timer.cancel.notify_one();
    }
}

/// 虚拟时钟：测试通过 [`MockClock::advance`] 显式推进时间。
///
/// 克隆体共享同一时间轴，可同时注入多个组件；推进时间会立即唤醒所有到期的睡眠。
#[derive(Clone, Debug)]
pub struct MockClock {
    inner: Arc<Mutex<MockClockState>>,
}

#[derive(Debug)]
struct MockClockState {
    origin: Instant,
    elapsed: Duration,
    sleepers: Vec<(Duration, Arc<Timer>)>,
}

impl MockClock {
    pub fn new() -> Self {
        Self::with_start(Instant::now())
    }

    /// 以指定起点构造虚拟时钟。
    pub fn with_start(origin: Instant) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockClockState {
                origin,
                elapsed: Duration::ZERO,
                sleepers: Vec::new(),
            })),
        }
    }

    /// 推进虚拟时间，并唤醒截止时间已到的睡眠。
    pub fn advance(&self, delta: Duration) {
        let due: Vec<_> = {
            let mut state = self.inner.lock();
            state.elapsed = state.elapsed.saturating_add(delta);
            let elapsed = state.elapsed;
            let (due, pending) = std::mem::take(&mut state.sleepers)
                .into_iter()
                .partition(|(deadline, _)| *deadline <= elapsed);
            state.sleepers = pending;
            due
        };
        for (_, timer) in due {
            timer.fire();
        }
    }

    /// 自构造以来累计推进的时长。
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().elapsed
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        let state = self.inner.lock();
        state.origin + state.elapsed
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        let timer = Arc::new(Timer::default());
        {
            let mut state = self.inner.lock();
            if duration.is_zero() {
                timer.state.lock().fired = true;
            } else {
                // 被丢弃的睡眠仍留在队列里，直到下一次推进越过其截止时间。
                let deadline = state.elapsed.saturating_add(duration);
                state.sleepers.push((deadline, Arc::clone(&timer)));
            }
        }
        Box::pin(TimerFuture { timer })
    }
}

/// 共享时钟句柄。
pub type SharedClock = Arc<dyn Clock>;

/// 默认的系统时钟句柄。
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// 一次调用的超时预算。
///
/// # 教案式说明
/// - **意图 (Why)**：嵌套子操作必须共享同一个截止时间，每一步只拿到“严格剩余”的额度；
/// - **契约 (What)**：
///   - [`TimeoutBudget::start`] 在调用入口计算一次；
///   - [`TimeoutBudget::remaining`] 随时钟推进单调递减，耗尽后恒为零；
///   - [`TimeoutBudget::remaining_for`] 在额度为零时直接返回 `Timeout` 错误，
///     子操作因此绝不会以零额度启动；
///   - [`TimeoutBudget::bound`] 让等待其他调用者（操作锁、在途构造）的环节同样受本预算约束；
/// - **实现 (How)**：记录起点与总额，剩余额度 = 总额 − 已流逝时长（饱和减法）。
#[derive(Clone)]
pub struct TimeoutBudget {
    clock: SharedClock,
    started: Instant,
    total: Duration,
}

impl TimeoutBudget {
    pub fn start(clock: SharedClock, total: Duration) -> Self {
        let started = clock.now();
        Self {
            clock,
            started,
            total,
        }
    }

    /// 原始总额度。
    pub fn total(&self) -> Duration {
        self.total
    }

    /// 自入口以来流逝的时长。
    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.started)
    }

    pub fn remaining(&self) -> Duration {
        self.total.saturating_sub(self.elapsed())
    }

    /// 为名为 `operation` 的子操作领取剩余额度。
    pub fn remaining_for(&self, operation: &str) -> Result<Duration> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return Err(ChannelError::timeout(operation, self.total));
        }
        Ok(remaining)
    }

    /// 在剩余额度内等待 `future` 完成，额度先耗尽时返回 `Timeout` 并丢弃 `future`。
    pub async fn bound<F: Future>(&self, operation: &str, future: F) -> Result<F::Output> {
        let remaining = self.remaining_for(operation)?;
        let future = pin!(future);
        match select(future, self.clock.sleep(remaining)).await {
            Either::Left((output, _)) => Ok(output),
            Either::Right(((), _)) => Err(ChannelError::timeout(operation, self.total)),
        }
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }
}

impl fmt::Debug for TimeoutBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutBudget")
            .field("total", &self.total)
            .field("remaining", &self.remaining())
            .finish()
    }
}
