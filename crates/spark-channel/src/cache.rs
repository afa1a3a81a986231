//! # cache：按端点特征共享通道工厂的有界缓存
//!
//! ## 核心意图（Why）
//! - 打开通道工厂需要元数据解析与凭据准备，结构等价的代理应当共用同一个已打开的工厂；
//! - 缓存是跨代理唯一可变共享的资源，查找、登记与淘汰都在一把缓存锁内完成。
//!
//! ## 行为契约（What）
//! - **查找**：命中但工厂已不在 `Opened` 的条目会被淘汰并视为未命中；命中 `Opened` 条目时为调用方
//!   增加一个引用；未命中时不插入任何条目，由调用方自行构造新工厂；
//! - **单飞构造**：同一特征同一时刻只允许一个构造者，其余查找者等待构造者的结果
//!   （登记成功则命中，失败则重新竞争构造权），保证并发代理最多打开一个工厂；
//! - **登记**：只有成功通过新工厂创建出首个通道后才登记；登记为缓存自身的持有增加一个引用；
//! - **容量**：超出容量时淘汰一个最久未被访问（查找命中或登记）的条目；
//! - **淘汰**：被淘汰条目释放缓存的持有，若恰为最后一个引用则由缓存就地中止工厂。
//!
//! ## 并发与锁（How）
//! - 所有映射操作在 `parking_lot::Mutex` 内完成；中止工厂、等待构造者均在锁外进行；
//! - 锁顺序固定为“代理状态锁 → 缓存锁”，缓存从不回调代理。
//!
//! ## 风险提示（Trade-offs）
//! - 等待构造者受等待方自身的打开预算约束：预算耗尽时返回 `Timeout`，构造者不受影响；
//!   等待方随后按打开失败处理，其所在代理进入 `Faulted`。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::endpoint::EndpointTrait;
use crate::error::Result;
use crate::observability::cache as keys;
use crate::refcount::RefCountedFactory;
use crate::state::CommunicationState;
use crate::time::TimeoutBudget;

/// 淘汰原因，对应日志字段 `cache.evict.reason`。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EvictReason {
    Stale,
    Overflow,
    Removed,
    Idle,
    Cleared,
}

impl EvictReason {
    const fn as_str(self) -> &'static str {
        match self {
            EvictReason::Stale => "stale",
            EvictReason::Overflow => "overflow",
            EvictReason::Removed => "removed",
            EvictReason::Idle => "idle",
            EvictReason::Cleared => "cleared",
        }
    }
}

struct CacheEntry {
    factory: Arc<RefCountedFactory>,
    last_used: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<EndpointTrait, CacheEntry>,
    pending: HashMap<EndpointTrait, watch::Receiver<()>>,
    tick: u64,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn least_recently_used(&self, except: &EndpointTrait) -> Option<EndpointTrait> {
        self.entries
            .iter()
            .filter(|(key, _)| *key != except)
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone())
    }
}

/// 一次查找的结果。
pub(crate) enum Resolution<'a> {
    /// 命中已打开的共享工厂，调用方已获得一个引用。
    Cached(Arc<RefCountedFactory>),
    /// 未命中，调用方获得该特征的独占构造权。
    Build(BuildPermit<'a>),
}

/// 某个特征的独占构造权。
///
/// 构造者成功创建首个通道后通过 [`BuildPermit::publish`] 登记工厂；
/// 任何提前返回（包括 Future 被取消）都会在 drop 时交还构造权并唤醒等待者。
pub(crate) struct BuildPermit<'a> {
    cache: &'a FactoryCache,
    key: EndpointTrait,
    _done: watch::Sender<()>,
}

impl BuildPermit<'_> {
    /// 登记新工厂；返回是否真正写入了缓存。
    pub(crate) fn publish(self, factory: &Arc<RefCountedFactory>) -> bool {
        self.cache.insert(&self.key, factory, true)
    }
}

impl Drop for BuildPermit<'_> {
    fn drop(&mut self) {
        self.cache.inner.lock().pending.remove(&self.key);
    }
}

/// 有界的通道工厂缓存。
pub struct FactoryCache {
    capacity: usize,
    retain_idle: bool,
    inner: Mutex<CacheInner>,
}

impl FactoryCache {
    /// 构造缓存。
    ///
    /// `retain_idle` 为 `false` 时，最后一个代理释放引用会同时移除条目并拆除工厂。
    pub fn new(capacity: usize, retain_idle: bool) -> Self {
        Self {
            capacity: capacity.max(1),
            retain_idle,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &EndpointTrait) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// 某特征的缓存条目上，除缓存自身持有之外的引用数。
    pub fn holder_count(&self, key: &EndpointTrait) -> Option<usize> {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.factory.ref_count().saturating_sub(1))
    }

    /// 非等待式查找：命中 `Opened` 条目时增加引用并返回。
    pub(crate) fn lookup(&self, key: &EndpointTrait) -> Option<Arc<RefCountedFactory>> {
        let (hit, stale) = {
            let mut inner = self.inner.lock();
            Self::lookup_locked(&mut inner, key)
        };
        self.dispose_evicted(stale);
        hit
    }

    /// 单飞查找：命中则返回共享工厂，否则在 `budget` 内等待在途构造者或取得构造权。
    pub(crate) async fn resolve(
        &self,
        key: &EndpointTrait,
        budget: &TimeoutBudget,
    ) -> Result<Resolution<'_>> {
        loop {
            let (outcome, stale) = {
                let mut inner = self.inner.lock();
                let (hit, stale) = Self::lookup_locked(&mut inner, key);
                let in_flight = inner.pending.get(key).cloned();
                let outcome = match hit {
                    Some(factory) => Ok(Resolution::Cached(factory)),
                    None => match in_flight {
                        Some(receiver) => Err(receiver),
                        None => {
                            let (sender, receiver) = watch::channel(());
                            inner.pending.insert(key.clone(), receiver);
                            Ok(Resolution::Build(BuildPermit {
                                cache: self,
                                key: key.clone(),
                                _done: sender,
                            }))
                        }
                    },
                };
                (outcome, stale)
            };
            self.dispose_evicted(stale);

            let mut waiter = match outcome {
                Ok(resolution) => return Ok(resolution),
                Err(waiter) => waiter,
            };
            debug!({ keys::FIELD_TRAIT } = %key, "waiting for in-flight factory construction");
            // 构造者从不发送值，只会丢弃发送端；`changed` 返回 Err 即表示构造已结束。
            let _ = budget.bound("cache.resolve", waiter.changed()).await?;
        }
    }

    /// 无构造权的登记：已有有效条目或在途构造者时放弃。
    pub(crate) fn try_publish(&self, key: &EndpointTrait, factory: &Arc<RefCountedFactory>) -> bool {
        self.insert(key, factory, false)
    }

    /// 若条目仍指向 `factory` 则移除，并释放缓存的持有。
    pub(crate) fn remove_if_same(&self, key: &EndpointTrait, factory: &Arc<RefCountedFactory>) {
        let removed = {
            let mut inner = self.inner.lock();
            match inner.entries.get(key) {
                Some(entry) if Arc::ptr_eq(&entry.factory, factory) => inner
                    .entries
                    .remove(key)
                    .map(|entry| (key.clone(), entry.factory, EvictReason::Removed)),
                _ => None,
            }
        };
        self.dispose_evicted(removed.into_iter().collect());
    }

    /// 代理释放其持有的共享工厂引用；返回是否释放了最后一个引用。
    ///
    /// 不保留空闲工厂时，若释放后只剩缓存自身的持有，条目会在同一临界区内被移除，
    /// 缓存的持有随之释放，调用方因此成为最后一个释放者。
    pub(crate) fn release_member(
        &self,
        key: &EndpointTrait,
        factory: &Arc<RefCountedFactory>,
    ) -> bool {
        let mut inner = self.inner.lock();
        if factory.release() {
            return true;
        }
        if self.retain_idle {
            return false;
        }
        let idle = matches!(
            inner.entries.get(key),
            Some(entry) if Arc::ptr_eq(&entry.factory, factory) && factory.ref_count() == 1
        );
        if !idle {
            return false;
        }
        inner.entries.remove(key);
        let len = inner.entries.len();
        drop(inner);
        info!(
            { keys::FIELD_TRAIT } = %key,
            { keys::FIELD_EVICT_REASON } = EvictReason::Idle.as_str(),
            { keys::FIELD_LEN } = len,
            "evicted idle channel factory"
        );
        factory.release()
    }

    /// 清空全部条目，释放缓存的持有。
    pub fn clear(&self) {
        let evicted: Vec<_> = {
            let mut inner = self.inner.lock();
            inner
                .entries
                .drain()
                .map(|(key, entry)| (key, entry.factory, EvictReason::Cleared))
                .collect()
        };
        self.dispose_evicted(evicted);
    }

    fn lookup_locked(
        inner: &mut CacheInner,
        key: &EndpointTrait,
    ) -> (Option<Arc<RefCountedFactory>>, Vec<Evicted>) {
        let opened = match inner.entries.get(key) {
            None => return (None, Vec::new()),
            Some(entry) => entry.factory.factory().state() == CommunicationState::Opened,
        };
        if !opened {
            let stale = inner
                .entries
                .remove(key)
                .map(|entry| (key.clone(), entry.factory, EvictReason::Stale));
            return (None, stale.into_iter().collect());
        }
        let tick = inner.next_tick();
        let Some(entry) = inner.entries.get_mut(key) else {
            return (None, Vec::new());
        };
        entry.last_used = tick;
        entry.factory.acquire();
        (Some(Arc::clone(&entry.factory)), Vec::new())
    }

    fn insert(
        &self,
        key: &EndpointTrait,
        factory: &Arc<RefCountedFactory>,
        holds_permit: bool,
    ) -> bool {
        if factory.factory().state() != CommunicationState::Opened {
            return false;
        }
        let (inserted, evicted, len) = {
            let mut inner = self.inner.lock();
            let mut evicted = Vec::new();
            let occupied = match inner.entries.get(key) {
                Some(entry) => entry.factory.factory().state() == CommunicationState::Opened,
                None => !holds_permit && inner.pending.contains_key(key),
            };
            if occupied {
                (false, evicted, inner.entries.len())
            } else {
                if let Some(entry) = inner.entries.remove(key) {
                    evicted.push((key.clone(), entry.factory, EvictReason::Stale));
                }
                factory.acquire();
                let last_used = inner.next_tick();
                inner.entries.insert(
                    key.clone(),
                    CacheEntry {
                        factory: Arc::clone(factory),
                        last_used,
                    },
                );
                if inner.entries.len() > self.capacity {
                    if let Some(victim) = inner.least_recently_used(key) {
                        if let Some(entry) = inner.entries.remove(&victim) {
                            evicted.push((victim, entry.factory, EvictReason::Overflow));
                        }
                    }
                }
                (true, evicted, inner.entries.len())
            }
        };
        if inserted {
            info!(
                { keys::FIELD_TRAIT } = %key,
                { keys::FIELD_LEN } = len,
                { keys::FIELD_REFS } = factory.ref_count(),
                "published channel factory"
            );
        }
        self.dispose_evicted(evicted);
        inserted
    }

    fn dispose_evicted(&self, evicted: Vec<Evicted>) {
        for (key, factory, reason) in evicted {
            let last = factory.release();
            info!(
                { keys::FIELD_TRAIT } = %key,
                { keys::FIELD_EVICT_REASON } = reason.as_str(),
                { keys::FIELD_REFS } = factory.ref_count(),
                "evicted channel factory"
            );
            if last {
                factory.factory().abort();
            }
        }
    }
}

type Evicted = (EndpointTrait, Arc<RefCountedFactory>, EvictReason);

impl fmt::Debug for FactoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryCache")
            .field("capacity", &self.capacity)
            .field("retain_idle", &self.retain_idle)
            .field("len", &self.len())
            .finish()
    }
}
