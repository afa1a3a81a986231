//! 通信对象的生命周期状态与迁移事件。

use std::fmt;

/// 通信对象的六个生命周期状态。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - 只允许前进：`Created → Opening → Opened → Closing → Closed`；
///   - `Faulted` 可由任意非终态进入；
///   - `Closed` 与 `Faulted` 均为终态且互斥；
/// - **实现 (How)**：以 `u8` 表示，便于引擎在原子变量中做无锁窥视（double-checked 快路径）。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommunicationState {
    Created = 0,
    Opening = 1,
    Opened = 2,
    Closing = 3,
    Closed = 4,
    Faulted = 5,
}

impl CommunicationState {
    /// 是否为终态（`Closed` 或 `Faulted`）。
    pub const fn is_terminal(self) -> bool {
        matches!(self, CommunicationState::Closed | CommunicationState::Faulted)
    }

    /// 判断 `self → next` 是否为合法迁移。
    ///
    /// 引擎在每次写入状态前调用本函数做断言，属性测试也以它为影子模型。
    pub const fn can_transition_to(self, next: CommunicationState) -> bool {
        use CommunicationState::*;
        match (self, next) {
            (Created, Opening) | (Opening, Opened) | (Opened, Closing) | (Closing, Closed) => {
                true
            }
            // 未打开的对象可直接关闭；Abort 可把任意非终态推进到 Closed。
            (Created | Opening | Opened, Closed) => true,
            (from, Faulted) => !from.is_terminal(),
            _ => false,
        }
    }

    pub(crate) const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => CommunicationState::Created,
            1 => CommunicationState::Opening,
            2 => CommunicationState::Opened,
            3 => CommunicationState::Closing,
            4 => CommunicationState::Closed,
            _ => CommunicationState::Faulted,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            CommunicationState::Created => "created",
            CommunicationState::Opening => "opening",
            CommunicationState::Opened => "opened",
            CommunicationState::Closing => "closing",
            CommunicationState::Closed => "closed",
            CommunicationState::Faulted => "faulted",
        }
    }
}

impl fmt::Display for CommunicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 生命周期迁移事件，每类事件在一个对象上至多触发一次。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    Opening,
    Opened,
    Closing,
    Closed,
    Faulted,
}

impl LifecycleEvent {
    pub const fn as_str(self) -> &'static str {
        match self {
            LifecycleEvent::Opening => "opening",
            LifecycleEvent::Opened => "opened",
            LifecycleEvent::Closing => "closing",
            LifecycleEvent::Closed => "closed",
            LifecycleEvent::Faulted => "faulted",
        }
    }

    pub(crate) const fn bit(self) -> u8 {
        match self {
            LifecycleEvent::Opening => 1,
            LifecycleEvent::Opened => 1 << 1,
            LifecycleEvent::Closing => 1 << 2,
            LifecycleEvent::Closed => 1 << 3,
            LifecycleEvent::Faulted => 1 << 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CommunicationState::*;

    #[test]
    fn terminal_states_accept_no_transition() {
        for next in [Created, Opening, Opened, Closing, Closed, Faulted] {
            assert!(!Closed.can_transition_to(next));
            assert!(!Faulted.can_transition_to(next));
        }
    }
}
