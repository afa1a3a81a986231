//! # refcount：带权威引用计数的通道工厂
//!
//! ## 意图（Why）
//! - 共享工厂何时可以物理关闭，只能由引用计数决定；任何组件都不能在仍有持有者（包括缓存
//!   自身的隐式持有）时关闭它；
//! - 对外只暴露 `release() -> 是否最后一个` 这一条契约，加引用只在 crate 内部（缓存命中、
//!   缓存登记）发生，杜绝调用方手工增减计数。
//!
//! ## 契约（What）
//! - 新建时计数为 1，归属创建它的代理；
//! - `release` 原子递减，当且仅当结果为 0 时返回 `true`，返回 `true` 的调用者独自负责拆除工厂；
//! - 计数已为 0 时再次释放返回 `false` 且不回绕。

use std::fmt;
use std::sync::Arc;

#[cfg(not(all(test, spark_loom)))]
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(all(test, spark_loom))]
use loom::sync::atomic::{AtomicUsize, Ordering};

use crate::factory::ChannelFactory;

/// 原子引用计数。
pub(crate) struct RefCount {
    count: AtomicUsize,
}

impl RefCount {
    pub(crate) fn new() -> Self {
        Self {
            count: AtomicUsize::new(1),
        }
    }

    pub(crate) fn acquire(&self) {
        let previous = self.count.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "acquire on a fully released reference");
    }

    pub(crate) fn release(&self) -> bool {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                debug_assert!(false, "release on a fully released reference");
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current == 1,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

/// 通道工厂与其权威引用计数。
pub struct RefCountedFactory {
    factory: Arc<ChannelFactory>,
    refs: RefCount,
}

impl RefCountedFactory {
    pub(crate) fn new(factory: Arc<ChannelFactory>) -> Arc<Self> {
        Arc::new(Self {
            factory,
            refs: RefCount::new(),
        })
    }

    pub(crate) fn acquire(&self) {
        self.refs.acquire();
    }

    /// 释放一个引用；返回 `true` 表示调用者释放了最后一个引用，需自行拆除工厂。
    pub fn release(&self) -> bool {
        self.refs.release()
    }

    pub fn factory(&self) -> &Arc<ChannelFactory> {
        &self.factory
    }

    /// 当前引用计数快照，含缓存的隐式持有。
    pub fn ref_count(&self) -> usize {
        self.refs.get()
    }
}

impl fmt::Debug for RefCountedFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCountedFactory")
            .field("factory", &self.factory)
            .field("refs", &self.ref_count())
            .finish()
    }
}
