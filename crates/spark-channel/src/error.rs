//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为生命周期引擎、通道工厂缓存、客户端代理与实例上下文提供统一的错误域；
//! - 错误按“处置策略”分类（[`ErrorKind`]），代理在缓存工厂失效时据此判定是否降级重试。
//!
//! ## 设计要求（What）
//! - [`ChannelError`] 携带稳定错误码（`<域>.<语义>`）、人类可读消息与可选底层原因；
//! - 只有 [`ErrorKind::is_transient`] 为真的错误允许触发私有工厂降级；
//! - 错误码集中在 [`codes`] 模块，日志与测试统一引用，避免字符串漂移。

use std::borrow::Cow;
use std::error::Error as StdError;

use thiserror::Error;

use crate::state::CommunicationState;

/// crate 内统一的返回别名。
pub type Result<T, E = ChannelError> = std::result::Result<T, E>;

/// 错误的处置分类。
///
/// # 教案式说明
/// - **意图 (Why)**：调用方需要区分“调用方误用”“状态不对”“可降级的通信故障”与“对象已毒化”等情形，
///   若依赖错误码前缀做字符串匹配，语义极易漂移；
/// - **契约 (What)**：六个变体一一对应生命周期契约中的错误分类；
/// - **风险 (Trade-offs)**：新增变体属于破坏性变更，需同步更新 [`ErrorKind::is_transient`]。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 调用方传入非法参数，构造期立即失败。
    ArgumentInvalid,
    /// 在错误的生命周期状态下调用操作。
    InvalidState,
    /// 传输或协议层失败。
    Communication,
    /// 超时预算耗尽。
    Timeout,
    /// 对象已关闭后仍被使用。
    Disposed,
    /// 对象已故障，永久不可用。
    Faulted,
}

impl ErrorKind {
    /// 是否属于“缓存工厂可能已失效”的瞬态错误。
    ///
    /// 代理只在此类错误上丢弃共享工厂并使用私有工厂重试一次。
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Communication | ErrorKind::Disposed | ErrorKind::Timeout
        )
    }

    /// 稳定的小写标签，供结构化日志使用。
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ArgumentInvalid => "argument_invalid",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Communication => "communication",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Disposed => "disposed",
            ErrorKind::Faulted => "faulted",
        }
    }
}

/// 稳定错误码。
///
/// 命名遵循 `channel.<组件>.<语义>`，日志、告警与测试断言共享同一事实来源。
pub mod codes {
    /// 超时时长或容量等参数非法。
    pub const ARGUMENT_INVALID: &str = "channel.argument.invalid";
    /// 操作在当前状态下不被允许。
    pub const INVALID_STATE: &str = "channel.lifecycle.invalid_state";
    /// 对象已关闭。
    pub const DISPOSED: &str = "channel.lifecycle.disposed";
    /// 对象已故障。
    pub const FAULTED: &str = "channel.lifecycle.faulted";
    /// 打开过程中对象被强制中止。
    pub const ABORTED: &str = "channel.lifecycle.aborted";
    /// 超时预算在子操作开始前已耗尽。
    pub const TIMEOUT: &str = "channel.lifecycle.timeout";
    /// 共享策略已冻结，禁止再修改。
    pub const SETTING_FROZEN: &str = "channel.sharing.frozen";
    /// 传输层通用失败。
    pub const TRANSPORT: &str = "channel.transport.failure";
    /// 配置文本无法解析。
    pub const CONFIG_PARSE: &str = "channel.config.parse";
}

type BoxedCause = Box<dyn StdError + Send + Sync + 'static>;

/// 生命周期核心的统一错误。
///
/// # 教案式说明
/// - **意图 (Why)**：Open/Close/CreateChannel 的失败需要同时满足“机器可判定”（`kind`/`code`）
///   与“人类可排障”（`message`/`source`），与 `spark-core` 的 `CoreError` 分层思路一致；
/// - **契约 (What)**：
///   - `kind`：处置分类，决定是否可降级重试；
///   - `code`：`'static` 稳定错误码，参见 [`codes`]；
///   - `message`：面向排障人员的描述；
///   - `source`：可选底层原因，通过 [`std::error::Error::source`] 暴露；
/// - **风险 (Trade-offs)**：`ChannelError` 不实现 `Clone`（底层原因不可克隆），
///   每个失败的调用方各自构造自己的错误。
#[derive(Debug, Error)]
#[error("[{code}] {message}")]
pub struct ChannelError {
    kind: ErrorKind,
    code: &'static str,
    message: Cow<'static, str>,
    #[source]
    source: Option<BoxedCause>,
}

impl ChannelError {
    /// 以分类、错误码与描述构造错误。
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            source: None,
        }
    }

    /// 附带底层原因。
    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn argument_invalid(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::ArgumentInvalid, codes::ARGUMENT_INVALID, message)
    }

    pub fn communication(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Communication, code, message)
    }

    /// 对象处于 `state` 时拒绝执行 `operation` 的错误。
    ///
    /// 根据状态挑选分类：已故障报 `Faulted`，已关闭报 `Disposed`，其余报 `InvalidState`。
    pub fn for_state(label: &str, operation: &'static str, state: CommunicationState) -> Self {
        match state {
            CommunicationState::Faulted => Self::new(
                ErrorKind::Faulted,
                codes::FAULTED,
                format!("`{label}` is faulted and cannot be used for `{operation}`"),
            ),
            CommunicationState::Closing | CommunicationState::Closed => Self::new(
                ErrorKind::Disposed,
                codes::DISPOSED,
                format!("`{label}` has been closed and cannot be used for `{operation}`"),
            ),
            other => Self::new(
                ErrorKind::InvalidState,
                codes::INVALID_STATE,
                format!("`{label}` is in state {other} which does not permit `{operation}`"),
            ),
        }
    }

    /// 超时预算耗尽。
    pub fn timeout(operation: &str, budget: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            codes::TIMEOUT,
            format!("`{operation}` did not start: the {budget:?} budget is exhausted"),
        )
    }

    /// 打开过程中被 `abort` 抢占。
    pub fn aborted(label: &str) -> Self {
        Self::communication(
            codes::ABORTED,
            format!("`{label}` was aborted while the operation was in progress"),
        )
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}
