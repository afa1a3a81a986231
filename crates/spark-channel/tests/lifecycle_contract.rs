//! 代理生命周期契约：幂等关闭、故障语义、并发关闭与打开期间中止。

mod support;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use spark_channel::error::codes;
use spark_channel::{
    ChannelSettings, ClientProxy, CommunicationState, ErrorKind, LifecycleEvent, MockClock,
    SharingRegistry,
};
use support::{Calculator, Counters, MockBinding};
use tokio::sync::Notify;

fn proxy(registry: &Arc<SharingRegistry>, binding: &MockBinding) -> Arc<ClientProxy<Calculator>> {
    Arc::new(
        ClientProxy::with_registry(
            Arc::clone(registry),
            binding.description::<Calculator>("mock://calc/lifecycle"),
        )
        .expect("proxy construction"),
    )
}

fn record_events(proxy: &ClientProxy<Calculator>) -> Arc<Mutex<Vec<LifecycleEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    proxy
        .lifecycle()
        .subscribe(Arc::new(move |event| sink.lock().push(event)));
    events
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn second_close_is_a_no_op() {
    support::init_tracing();
    let binding = MockBinding::new();
    let counters = Arc::clone(&binding.counters);
    let registry = support::registry();
    let proxy = proxy(&registry, &binding);
    let events = record_events(&proxy);

    proxy.open().await.unwrap();
    proxy.close().await.unwrap();
    proxy.close().await.unwrap();

    assert_eq!(proxy.state(), CommunicationState::Closed);
    assert_eq!(Counters::get(&counters.channel_closes), 1);
    let closed = events
        .lock()
        .iter()
        .filter(|event| **event == LifecycleEvent::Closed)
        .count();
    assert_eq!(closed, 1);
    assert_eq!(
        *events.lock(),
        vec![
            LifecycleEvent::Opening,
            LifecycleEvent::Opened,
            LifecycleEvent::Closing,
            LifecycleEvent::Closed,
        ]
    );
}

#[tokio::test]
async fn closing_an_unopened_proxy_takes_the_abort_path() {
    let binding = MockBinding::new();
    let counters = Arc::clone(&binding.counters);
    let registry = support::registry();
    let proxy = proxy(&registry, &binding);

    proxy.close().await.unwrap();
    assert_eq!(proxy.state(), CommunicationState::Closed);
    assert_eq!(Counters::get(&counters.factories_built), 0);

    let err = proxy.open().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Disposed);
}

#[tokio::test]
async fn faulted_proxy_refuses_to_reopen_and_close_tears_down() {
    let binding = MockBinding::new();
    let counters = Arc::clone(&binding.counters);
    binding
        .behavior
        .fail_factory_open
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let registry = support::registry();
    let proxy = proxy(&registry, &binding);
    let events = record_events(&proxy);

    let err = proxy.open().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Communication);
    assert_eq!(err.code(), codes::TRANSPORT);
    assert_eq!(proxy.state(), CommunicationState::Faulted);
    assert!(events.lock().contains(&LifecycleEvent::Faulted));

    let again = proxy.open().await.unwrap_err();
    assert_eq!(again.kind(), ErrorKind::Faulted);
    assert_eq!(Counters::get(&counters.factory_opens), 1, "hooks are not re-run");

    let closed = proxy.close().await.unwrap_err();
    assert_eq!(closed.kind(), ErrorKind::Faulted);
    assert_eq!(proxy.state(), CommunicationState::Faulted);
    assert!(proxy.factory_released());
    assert_eq!(Counters::get(&counters.factory_aborts), 1);
    // 失败的构造者不会把工厂留在缓存里。
    assert!(registry.domain::<Calculator>().cache().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_close_waits_for_the_first() {
    let binding = MockBinding::new();
    let counters = Arc::clone(&binding.counters);
    let registry = support::registry();
    let proxy = proxy(&registry, &binding);
    let events = record_events(&proxy);
    proxy.open().await.unwrap();

    let gate = Arc::new(Notify::new());
    *binding.behavior.channel_close_gate.lock() = Some(Arc::clone(&gate));

    let first = tokio::spawn({
        let proxy = Arc::clone(&proxy);
        async move { proxy.close().await }
    });
    wait_until(|| proxy.state() == CommunicationState::Closing).await;

    let second = tokio::spawn({
        let proxy = Arc::clone(&proxy);
        async move { proxy.close().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!second.is_finished(), "second close returned before the first completed");

    gate.notify_one();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(proxy.state(), CommunicationState::Closed);
    assert_eq!(Counters::get(&counters.channel_closes), 1);
    let closed = events
        .lock()
        .iter()
        .filter(|event| **event == LifecycleEvent::Closed)
        .count();
    assert_eq!(closed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_close_gives_up_when_its_own_budget_runs_out() {
    let binding = MockBinding::new();
    let counters = Arc::clone(&binding.counters);
    let clock = MockClock::new();
    let registry = Arc::new(
        SharingRegistry::with_clock(ChannelSettings::default(), Arc::new(clock.clone())).unwrap(),
    );
    let proxy = proxy(&registry, &binding);
    proxy.open().await.unwrap();

    let gate = Arc::new(Notify::new());
    *binding.behavior.channel_close_gate.lock() = Some(Arc::clone(&gate));
    let first = tokio::spawn({
        let proxy = Arc::clone(&proxy);
        async move { proxy.close().await }
    });
    wait_until(|| proxy.state() == CommunicationState::Closing).await;

    let second = tokio::spawn({
        let proxy = Arc::clone(&proxy);
        async move { proxy.close_with_timeout(Duration::from_millis(50)).await }
    });
    for _ in 0..1_000 {
        if second.is_finished() {
            break;
        }
        clock.advance(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let err = second.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(!first.is_finished());
    assert_eq!(proxy.state(), CommunicationState::Closing);

    gate.notify_one();
    first.await.unwrap().unwrap();
    assert_eq!(proxy.state(), CommunicationState::Closed);
    assert_eq!(Counters::get(&counters.channel_closes), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_during_open_fails_the_open_with_aborted() {
    let binding = MockBinding::new();
    let counters = Arc::clone(&binding.counters);
    let gate = Arc::new(Notify::new());
    *binding.behavior.factory_open_gate.lock() = Some(Arc::clone(&gate));
    let registry = support::registry();
    let proxy = proxy(&registry, &binding);

    let opening = tokio::spawn({
        let proxy = Arc::clone(&proxy);
        async move { proxy.open().await }
    });
    wait_until(|| Counters::get(&counters.factory_opens) == 1).await;

    // 中止不等待仍在进行的打开。
    proxy.abort();
    assert_eq!(proxy.state(), CommunicationState::Closed);
    assert_eq!(Counters::get(&counters.factory_aborts), 1);

    gate.notify_one();
    let err = opening.await.unwrap().unwrap_err();
    assert_eq!(err.code(), codes::ABORTED);
    assert_eq!(proxy.state(), CommunicationState::Closed);
    assert_eq!(Counters::get(&counters.channels_created), 0);
    assert_eq!(Counters::get(&counters.factory_aborts), 1);
}

#[tokio::test]
async fn dropping_an_open_proxy_releases_its_reference() {
    let binding = MockBinding::new();
    let counters = Arc::clone(&binding.counters);
    let registry = support::registry();
    let proxy = proxy(&registry, &binding);
    proxy.open().await.unwrap();

    drop(proxy);
    assert_eq!(Counters::get(&counters.channel_aborts), 1);
    assert_eq!(Counters::get(&counters.factory_aborts), 1);
    assert!(registry.domain::<Calculator>().cache().is_empty());
}

#[test]
fn blocking_twins_work_without_a_runtime() {
    let binding = MockBinding::new();
    let counters = Arc::clone(&binding.counters);
    let registry = support::registry();
    let first = proxy(&registry, &binding);

    let channel = first.channel_blocking().unwrap();
    assert_eq!(channel.state(), CommunicationState::Opened);
    assert_eq!(first.state(), CommunicationState::Opened);

    first.close_blocking().unwrap();
    assert_eq!(channel.state(), CommunicationState::Closed);
    assert_eq!(counters.factory_teardowns(), 1);

    let second = proxy(&registry, &binding);
    second.open_blocking().unwrap();
    assert_eq!(Counters::get(&counters.factory_opens), 2);
    second.close_blocking().unwrap();
}
