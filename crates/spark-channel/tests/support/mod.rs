//! 集成测试共享的可编程传输桩。
//!
//! `MockBinding` 构造的每个传输工厂都有递增序号，测试可以按序号注入故障，
//! 并通过 [`Counters`] 观察打开、关闭与中止次数。

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use spark_channel::error::codes;
use spark_channel::{
    Binding, BindingId, ChannelError, ChannelSettings, ChannelShape, ContractId, EndpointAddress,
    EndpointDescription, MockClock, Result, ServiceContract, SharingRegistry, TransportChannel,
    TransportFactory,
};
use tokio::sync::Notify;

/// 请求-应答契约。
pub struct Calculator;

impl ServiceContract for Calculator {
    const NAME: &'static str = "calculator";
    const SHAPE: ChannelShape = ChannelShape::RequestReply;
}

/// 双工契约。
pub struct Ticker;

impl ServiceContract for Ticker {
    const NAME: &'static str = "ticker";
    const SHAPE: ChannelShape = ChannelShape::Duplex;
}

/// 可观察的调用计数。
#[derive(Debug, Default)]
pub struct Counters {
    pub factories_built: AtomicUsize,
    pub factory_opens: AtomicUsize,
    pub factory_closes: AtomicUsize,
    pub factory_aborts: AtomicUsize,
    pub channels_created: AtomicUsize,
    pub channel_opens: AtomicUsize,
    pub channel_closes: AtomicUsize,
    pub channel_aborts: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// 工厂被物理拆除（关闭或中止）的次数。
    pub fn factory_teardowns(&self) -> usize {
        Self::get(&self.factory_closes) + Self::get(&self.factory_aborts)
    }
}

/// 测试注入的行为。
#[derive(Default)]
pub struct Behavior {
    pub fail_factory_open: AtomicBool,
    /// 这些序号的工厂在创建通道时返回通信错误。
    pub failing_factories: Mutex<HashSet<usize>>,
    /// 工厂打开耗时：推进虚拟时钟。
    pub factory_open_cost: Mutex<Option<(MockClock, Duration)>>,
    /// 设置后工厂打开会等待该信号。
    pub factory_open_gate: Mutex<Option<Arc<Notify>>>,
    /// 设置后通道关闭会等待该信号。
    pub channel_close_gate: Mutex<Option<Arc<Notify>>>,
    pub factory_open_timeouts: Mutex<Vec<Duration>>,
    pub channel_open_timeouts: Mutex<Vec<Duration>>,
}

#[derive(Clone)]
pub struct MockBinding {
    pub counters: Arc<Counters>,
    pub behavior: Arc<Behavior>,
    fingerprint: &'static str,
}

impl MockBinding {
    pub fn new() -> Self {
        Self::with_fingerprint("framing=length")
    }

    pub fn with_fingerprint(fingerprint: &'static str) -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            behavior: Arc::new(Behavior::default()),
            fingerprint,
        }
    }

    pub fn description<C: ServiceContract>(&self, address: &str) -> EndpointDescription {
        EndpointDescription::new(
            ContractId::of::<C>(),
            Arc::new(self.clone()),
            EndpointAddress::parse(address.to_owned()).expect("valid address"),
        )
    }
}

impl Binding for MockBinding {
    fn identity(&self) -> BindingId {
        BindingId::new("mock", "mock-binding", self.fingerprint)
    }

    fn build_factory(&self, _endpoint: &EndpointDescription) -> Result<Arc<dyn TransportFactory>> {
        let serial = self.counters.factories_built.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(MockFactory {
            serial,
            counters: Arc::clone(&self.counters),
            behavior: Arc::clone(&self.behavior),
        }))
    }
}

struct MockFactory {
    serial: usize,
    counters: Arc<Counters>,
    behavior: Arc<Behavior>,
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn open(&self, timeout: Duration) -> Result<()> {
        self.counters.factory_opens.fetch_add(1, Ordering::SeqCst);
        self.behavior.factory_open_timeouts.lock().push(timeout);
        let gate = self.behavior.factory_open_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some((clock, cost)) = self.behavior.factory_open_cost.lock().clone() {
            clock.advance(cost);
        }
        if self.behavior.fail_factory_open.load(Ordering::SeqCst) {
            return Err(ChannelError::communication(codes::TRANSPORT, "metadata exchange refused"));
        }
        Ok(())
    }

    async fn close(&self, _timeout: Duration) -> Result<()> {
        self.counters.factory_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn abort(&self) {
        self.counters.factory_aborts.fetch_add(1, Ordering::SeqCst);
    }

    fn create_channel(
        &self,
        shape: ChannelShape,
        _address: &EndpointAddress,
    ) -> Result<Box<dyn TransportChannel>> {
        if self.behavior.failing_factories.lock().contains(&self.serial) {
            return Err(ChannelError::communication(
                codes::TRANSPORT,
                format!("factory #{} lost its connection pool", self.serial),
            ));
        }
        self.counters.channels_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockChannel {
            shape,
            counters: Arc::clone(&self.counters),
            behavior: Arc::clone(&self.behavior),
        }))
    }
}

struct MockChannel {
    shape: ChannelShape,
    counters: Arc<Counters>,
    behavior: Arc<Behavior>,
}

#[async_trait]
impl TransportChannel for MockChannel {
    fn shape(&self) -> ChannelShape {
        self.shape
    }

    async fn open(&self, timeout: Duration) -> Result<()> {
        self.counters.channel_opens.fetch_add(1, Ordering::SeqCst);
        self.behavior.channel_open_timeouts.lock().push(timeout);
        Ok(())
    }

    async fn close(&self, _timeout: Duration) -> Result<()> {
        let gate = self.behavior.channel_close_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.counters.channel_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn abort(&self) {
        self.counters.channel_aborts.fetch_add(1, Ordering::SeqCst);
    }
}

/// 测试专用注册表，避免用例之间通过进程级注册表互相污染。
pub fn registry() -> Arc<SharingRegistry> {
    registry_with(ChannelSettings::default())
}

pub fn registry_with(settings: ChannelSettings) -> Arc<SharingRegistry> {
    Arc::new(SharingRegistry::new(settings).expect("valid settings"))
}

/// 安装输出到测试捕获的日志订阅者；可重复调用。
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
