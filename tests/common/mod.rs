#![allow(dead_code)]

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tokio::time;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tagrelay::logging::init_logging("debug");
    });
}

/// Poll `check` every 10ms until it holds, for at most two seconds.
pub async fn wait_until<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return true;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Await `fut`, failing the test after five seconds.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}
