use std::time::Duration;

fn runtime(label: &str) -> String {
    format!("runtime:{label}")
}

fn sender(value: u32) -> u32 {
    value + 1
}

fn timeout_duration() -> Duration {
    Duration::from_millis(5)
}

#[test_timeout::tokio_timeout_test]
async fn async_body_sees_its_own_helpers() {
    assert_eq!(runtime("a"), "runtime:a");
    assert_eq!(sender(1), 2);
    tokio::time::sleep(timeout_duration()).await;
}

#[test_timeout::tokio_timeout_test(paused)]
async fn paused_body_sees_its_own_helpers() {
    let started = tokio::time::Instant::now();
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(started.elapsed() >= Duration::from_secs(3600));
    assert_eq!(runtime("b"), "runtime:b");
}

#[test_timeout::timeout]
fn sync_body_sees_its_own_helpers() {
    let result = sender(41);
    assert_eq!(result, 42);
    assert_eq!(timeout_duration(), Duration::from_millis(5));
}
