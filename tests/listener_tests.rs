//! Integration tests for the `Listener`: discovery, device-id assignment and
//! routing, over TCP and in-process links.

use smartport_relay::smartport::dib::UnitStatus;
use smartport_relay::{
    BlockNumber, DeviceInfo, DeviceRange, DiskDevices, Listener, ListenerState, ReadBlockRequest,
    RelayConfig, RelayError, Requestor, Response, SimHandle, SimulatedDevice, WriteBlockRequest,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::duplex;
use tokio::net::TcpStream;

const TIMEOUT: Duration = Duration::from_secs(2);

fn test_config() -> RelayConfig {
    RelayConfig {
        request_timeout_ms: 300,
        settle_timeout_ms: 500,
        accept_poll_ms: 20,
        ..RelayConfig::default()
    }
}

fn new_listener() -> Listener {
    smartport_relay::logging::try_init_logger();
    Listener::with_requestor(&test_config(), Arc::new(Requestor::new()))
}

async fn connect_sim(addr: SocketAddr, device: SimulatedDevice) -> SimHandle {
    let stream = TcpStream::connect(addr).await.unwrap();
    device.spawn(stream)
}

async fn attach_sim(listener: &Listener, device: SimulatedDevice) -> (Option<DeviceRange>, SimHandle) {
    let (near, far) = duplex(8192);
    let sim = device.spawn(far);
    let range = listener.attach_link(near, "sim").await.unwrap();
    (range, sim)
}

async fn wait_for_devices(listener: &Listener, count: u8) {
    tokio::time::timeout(TIMEOUT, async {
        while listener.total_device_count() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("devices were not discovered in time");
}

/// Tests that a link with three units receives exactly three ids.
#[tokio::test]
async fn test_tcp_discovery_counts_units() {
    let listener = new_listener();
    let addr = listener.start("127.0.0.1", 0).await.unwrap();
    assert_eq!(listener.local_addr().await, Some(addr));

    let _sim = connect_sim(addr, SimulatedDevice::with_disks(3)).await;
    wait_for_devices(&listener, 3).await;

    assert_eq!(listener.total_device_count(), 3);
    assert_eq!(listener.device_ranges(), vec![DeviceRange { start: 1, end: 3 }]);
    listener.stop().await;
}

/// Tests that links receive disjoint ranges in discovery order.
#[tokio::test]
async fn test_tcp_links_get_disjoint_ranges() {
    let listener = new_listener();
    let addr = listener.start("127.0.0.1", 0).await.unwrap();

    let _first = connect_sim(addr, SimulatedDevice::with_disks(2)).await;
    wait_for_devices(&listener, 2).await;
    let _second = connect_sim(addr, SimulatedDevice::with_disks(4)).await;
    wait_for_devices(&listener, 6).await;

    assert_eq!(
        listener.device_ranges(),
        vec![DeviceRange { start: 1, end: 2 }, DeviceRange { start: 3, end: 6 }]
    );
    assert_eq!(listener.connection_count(), 2);
    listener.stop().await;
}

/// Tests local unit ids and that calls are rewritten to them.
#[tokio::test]
async fn test_call_routes_to_local_unit() {
    let listener = new_listener();
    let (_, first) = attach_sim(&listener, SimulatedDevice::with_disks(3)).await;
    let (range, second) = attach_sim(&listener, SimulatedDevice::with_disks(2)).await;
    assert_eq!(range, Some(DeviceRange { start: 4, end: 5 }));

    let (unit, _) = listener.find_connection_for_device(5).unwrap();
    assert_eq!(unit, 2);
    assert!(listener.find_connection_for_device(6).is_none());

    let block = BlockNumber::new(9).unwrap();
    let write = WriteBlockRequest::from_slice(listener.next_sequence_number(), 5, block, &[0x5A; 512]).unwrap();
    let response = listener.call(5, write, TIMEOUT).await.unwrap();
    assert!(response.is_ok());

    assert!(second.block(2, 9).is_some());
    assert!(first.block(2, 9).is_none());

    let read = ReadBlockRequest::new(listener.next_sequence_number(), 5, block);
    let response = listener.call_default(5, read).await.unwrap();
    assert!(response.block_data.iter().all(|&b| b == 0x5A));
    listener.stop().await;
}

/// Tests that unknown ids are unroutable.
#[tokio::test]
async fn test_call_unknown_device_is_unroutable() {
    let listener = new_listener();
    let _ = attach_sim(&listener, SimulatedDevice::with_disks(1)).await;

    let read = ReadBlockRequest::new(listener.next_sequence_number(), 2, BlockNumber::default());
    assert!(matches!(
        listener.call(2, read, TIMEOUT).await,
        Err(RelayError::Unroutable(2))
    ));
    listener.stop().await;
}

/// Tests that a link without units is tracked but owns no ids.
#[tokio::test]
async fn test_zero_unit_link() {
    let listener = new_listener();
    let (range, _sim) = attach_sim(&listener, SimulatedDevice::new()).await;
    assert_eq!(range, None);
    assert_eq!(listener.connection_count(), 1);
    assert_eq!(listener.total_device_count(), 0);

    let (range, _sim) = attach_sim(&listener, SimulatedDevice::with_disks(1)).await;
    assert_eq!(range, Some(DeviceRange { start: 1, end: 1 }));
    listener.stop().await;
}

/// Tests that a link which stops answering during discovery is skipped.
#[tokio::test]
async fn test_unresponsive_link_is_skipped() {
    let listener = new_listener();
    let (near, far) = duplex(8192);
    let _sim = SimulatedDevice::with_disks(3).silent_unit(2).spawn(far);

    let result = listener.attach_link(near, "flaky").await;
    assert!(matches!(result, Err(RelayError::Timeout { .. })));
    assert_eq!(listener.connection_count(), 0);
    assert_eq!(listener.total_device_count(), 0);
}

/// Tests that the id space stops at 254.
#[tokio::test]
async fn test_capacity_ceiling() {
    let listener = new_listener();
    let (range, _a) = attach_sim(&listener, SimulatedDevice::with_disks(250)).await;
    assert_eq!(range, Some(DeviceRange { start: 1, end: 250 }));

    let (range, _b) = attach_sim(&listener, SimulatedDevice::with_disks(10)).await;
    assert_eq!(range, Some(DeviceRange { start: 251, end: 254 }));

    let (range, _c) = attach_sim(&listener, SimulatedDevice::with_disks(1)).await;
    assert_eq!(range, None);
    assert_eq!(listener.total_device_count(), 254);
    listener.stop().await;
}

/// Tests that links discovered at the same time near the ceiling each get a
/// range as wide as the units they reported.
#[tokio::test]
async fn test_concurrent_discovery_near_ceiling() {
    let listener = new_listener();
    let (range, _a) = attach_sim(&listener, SimulatedDevice::with_disks(250)).await;
    assert_eq!(range, Some(DeviceRange { start: 1, end: 250 }));

    let (first, second) = tokio::join!(
        attach_sim(&listener, SimulatedDevice::with_disks(3)),
        attach_sim(&listener, SimulatedDevice::with_disks(3)),
    );
    let (first, _b) = first;
    let (second, _c) = second;

    let mut widths = vec![first.unwrap().len(), second.unwrap().len()];
    widths.sort_unstable();
    assert_eq!(widths, vec![1, 3]);
    assert_eq!(listener.total_device_count(), 254);

    for device_id in 251..=254 {
        let (unit, _) = listener.find_connection_for_device(device_id).unwrap();
        let read = ReadBlockRequest::new(listener.next_sequence_number(), device_id, BlockNumber::default());
        let response = listener.call(device_id, read, TIMEOUT).await.unwrap();
        assert!(response.is_ok(), "device {device_id} (unit {unit}) unreachable");
    }
    listener.stop().await;
}

/// Tests that stop waits for a running discovery and closes its link.
#[tokio::test]
async fn test_stop_during_discovery_closes_link() {
    let listener = new_listener();
    let (near, far) = duplex(8192);
    let sim = SimulatedDevice::with_disks(2)
        .reply_delay(1, Duration::from_millis(150))
        .spawn(far);

    let (attached, _) = tokio::join!(listener.attach_link(near, "slow"), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        listener.stop().await;
    });

    assert_eq!(attached.unwrap(), Some(DeviceRange { start: 1, end: 2 }));
    assert_eq!(listener.connection_count(), 0);
    assert_eq!(listener.total_device_count(), 0);
    assert!(listener.find_connection_for_device(1).is_none());
    tokio::time::timeout(TIMEOUT, sim.join()).await.unwrap();
}

/// Tests that stop then start leaves an empty device space.
#[tokio::test]
async fn test_restart_resets_device_count() {
    let listener = new_listener();
    let addr = listener.start("127.0.0.1", 0).await.unwrap();
    let _sim = connect_sim(addr, SimulatedDevice::with_disks(2)).await;
    wait_for_devices(&listener, 2).await;

    listener.stop().await;
    assert_eq!(listener.state(), ListenerState::Stopped);
    listener.stop().await;

    listener.start("127.0.0.1", 0).await.unwrap();
    assert!(listener.is_listening());
    assert_eq!(listener.total_device_count(), 0);
    assert!(listener.enumerate_devices().is_empty());
    listener.stop().await;
}

/// Tests that stopping closes every link.
#[tokio::test]
async fn test_stop_closes_links() {
    let listener = new_listener();
    let (_, sim) = attach_sim(&listener, SimulatedDevice::with_disks(1)).await;
    let (_, connection) = listener.find_connection_for_device(1).unwrap();

    listener.stop().await;
    assert!(!connection.is_connected());
    tokio::time::timeout(TIMEOUT, sim.join()).await.unwrap();
}

/// Tests disk detection and that its result is cached.
#[tokio::test]
async fn test_first_two_disk_devices() {
    let listener = new_listener();

    let printer = DeviceInfo {
        device_type: 0x05,
        ..DeviceInfo::disk("PRINTER", 0)
    };
    let offline = DeviceInfo {
        status: UnitStatus::BLOCK_DEVICE | UnitStatus::READ_ALLOWED,
        ..DeviceInfo::disk("EMPTY_DRIVE", 280)
    };
    let chain = SimulatedDevice::new()
        .add_unit(printer)
        .add_unit(offline)
        .add_unit(DeviceInfo::disk("DISK_A", 280))
        .add_unit(DeviceInfo::disk("DISK_B", 1600))
        .add_unit(DeviceInfo::disk("DISK_C", 65535));
    let _ = attach_sim(&listener, chain).await;

    let disks = listener.first_two_disk_devices().await;
    assert_eq!(
        disks,
        DiskDevices {
            first: Some(3),
            second: Some(4)
        }
    );

    let _ = attach_sim(&listener, SimulatedDevice::with_disks(1)).await;
    assert_eq!(listener.first_two_disk_devices().await, disks);

    listener.stop().await;
    assert_eq!(listener.first_two_disk_devices().await, DiskDevices::default());
}

/// Tests disk detection on a single disk.
#[tokio::test]
async fn test_first_two_disk_devices_single_disk() {
    let listener = new_listener();
    let _ = attach_sim(&listener, SimulatedDevice::with_disks(1)).await;
    let disks = listener.first_two_disk_devices().await;
    assert_eq!(disks.first, Some(1));
    assert_eq!(disks.second, None);
}

/// Tests that `launch` honours `start_on_init`.
#[tokio::test]
async fn test_launch_respects_start_on_init() {
    let config = RelayConfig {
        address: "127.0.0.1".to_string(),
        port: 0,
        start_on_init: false,
        ..test_config()
    };
    let listener = Listener::launch(&config).await.unwrap();
    assert_eq!(listener.state(), ListenerState::Stopped);

    let config = RelayConfig {
        start_on_init: true,
        ..config
    };
    let listener = Listener::launch(&config).await.unwrap();
    assert!(listener.is_listening());
    listener.stop().await;
}

/// Tests that a malformed bind address falls back to all interfaces.
#[tokio::test]
async fn test_malformed_address_falls_back() {
    let listener = new_listener();
    let addr = listener.start("300.1.2.3", 0).await.unwrap();
    assert!(addr.ip().is_unspecified());
    listener.stop().await;
}
