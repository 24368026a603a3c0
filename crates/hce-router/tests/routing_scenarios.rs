//! 端到端场景：注册中心驱动规划器写入内存控制器，再通过查询接口观察结果。

use std::sync::Arc;

use hce_core::{Category, ExecutionEnvironment, HceConfig, HceError, Service, ServiceId};
use hce_router::{DeviceHost, ExecutionEnvironmentAdapter, InMemoryDeviceHost, ServiceRegistry};
use tracing_test::traced_test;

fn id(name: &str) -> ServiceId {
    ServiceId::new("com.example.nfc", name).expect("身份合法")
}

fn registry(host: &Arc<InMemoryDeviceHost>) -> ServiceRegistry {
    let adapter = Arc::new(ExecutionEnvironmentAdapter::new(
        Arc::clone(host) as Arc<dyn DeviceHost>
    ));
    ServiceRegistry::from_config(adapter, &HceConfig::default())
}

#[traced_test]
#[test]
fn primary_secure_set_is_planned_before_normal_set() {
    let host = InMemoryDeviceHost::builder()
        .default_route(0x81)
        .uiccs([0x81])
        .capacity(512)
        .build();
    let registry = registry(&host);
    registry
        .register_service(Service::builder(id("A")).build())
        .expect("注册成功");
    registry
        .register_service(Service::builder(id("B")).build())
        .expect("注册成功");
    registry
        .add_pattern_set(&id("B"), "normal", ["A010203040506070"])
        .expect("合法");
    registry
        .add_pattern_set(&id("A"), "secure", ["F0102030405060"])
        .expect("合法");
    registry.set_primary(Some(&id("A"))).expect("服务存在");

    let committed = host.committed();
    assert_eq!(committed.len(), 3);
    assert_eq!(hex_of(&committed[0].aid), "F0102030405060");
    assert_eq!(hex_of(&committed[1].aid), "A010203040506070");
    assert!(committed[2].aid.is_empty());

    let snapshot = registry.planner().snapshot();
    let owners: Vec<_> = snapshot
        .sets()
        .iter()
        .filter_map(|set| set.owner())
        .map(|owner| owner.id().ability().to_owned())
        .collect();
    assert_eq!(owners, vec!["A", "B"]);
    assert!(logs_contain("routing table committed"));
}

#[test]
fn oversized_set_is_rolled_back_cleanly() {
    let host = InMemoryDeviceHost::builder()
        .default_route(0x81)
        .uiccs([0x81])
        .capacity(16)
        .build();
    let registry = registry(&host);
    registry
        .register_service(Service::builder(id("Big")).build())
        .expect("注册成功");
    let before = host.committed();

    registry
        .add_pattern_set(&id("Big"), "normal", ["A0000000031010", "A0000000041010"])
        .expect("集合被丢弃而不是报错");
    let after = host.committed();
    assert_eq!(before, after);
    assert_eq!(after.len(), 1);
    assert!(registry.lookup("A0000000031010").expect("合法").is_empty());
}

#[test]
fn off_host_sets_route_to_their_secure_element() {
    let host = InMemoryDeviceHost::builder()
        .default_route(0x00)
        .eses([0x86, 0x87])
        .build();
    let registry = registry(&host);
    let card = Service::builder(id("Card"))
        .environment(ExecutionEnvironment::new("eSE2"))
        .build();
    registry.register_service(card).expect("注册成功");
    registry
        .add_pattern_set(&id("Card"), "normal", ["A000000151000000"])
        .expect("合法");

    let committed = host.committed();
    assert_eq!(committed.len(), 2);
    assert_eq!(committed[0].route, 0x87);
    assert_eq!(committed[1].route, 0x00);

    registry.mark_off_host(&id("Card"), "eSE1").expect("可寻址");
    assert_eq!(host.committed()[0].route, 0x86);
    assert!(registry
        .is_default_service_for_aid(&id("Card"), "A000000151000000")
        .expect("合法"));
}

#[test]
fn unready_controller_is_reported_to_the_caller() {
    let host = InMemoryDeviceHost::builder().not_ready().build();
    let registry = registry(&host);
    let err = registry
        .register_service(Service::builder(id("A")).build())
        .expect_err("控制器未就绪");
    assert_eq!(err, HceError::AdapterNotReady {
        detail: "controller did not report a default route".to_owned()
    });
    assert_eq!(registry.services().len(), 1);

    host.set_ready(true);
    registry.replan().expect("就绪后重建成功");
    assert!(!registry.is_default_service_for_category(&id("A"), Category::Normal));
    assert!(registry.planner().snapshot().revision() >= 1);
}

fn hex_of(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02X}")).collect()
}
