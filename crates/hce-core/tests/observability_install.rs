//! 订阅器安装是进程级副作用，本文件只放一个用例，独占一个测试进程。

use hce_core::HceConfig;
use hce_core::observability::{ObservabilityError, install};

#[test]
fn install_is_effective_once() {
    let config = HceConfig::default();
    assert_eq!(install(&config), Ok(()));
    assert_eq!(install(&config), Err(ObservabilityError::AlreadyInstalled));
    tracing::info!(target: "hce", "subscriber installed");
}
