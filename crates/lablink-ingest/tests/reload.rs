//! Supervisor lifecycle: hot reload diffs by port, drains removed
//! listeners and closes their connections promptly.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use lablink_core::{AnalyzerType, EventBus, ListenerSpec, WireProtocol};
use lablink_db::{Database, DbConfig};
use lablink_ingest::{IngestContext, ListenerSupervisor};

fn spec(port: u16, analyzer: AnalyzerType, protocol: WireProtocol) -> ListenerSpec {
    ListenerSpec {
        port,
        analyzer_type: analyzer,
        protocol,
        field_map_id: None,
    }
}

async fn supervisor() -> ListenerSupervisor {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    ListenerSupervisor::new(IngestContext {
        db,
        events: EventBus::new(),
        idle_timeout: Duration::from_secs(30),
        app_name: "LabLink".into(),
    })
}

#[tokio::test]
async fn reload_swaps_ports_and_closes_open_connections() {
    let mut sup = supervisor().await;

    sup.start(vec![spec(39151, AnalyzerType::SysmexXnL, WireProtocol::Astm)])
        .await
        .unwrap();
    assert_eq!(sup.bound_ports(), vec![39151]);

    // An analyzer is connected while the config changes underneath it.
    let addr = sup.local_addr(39151).unwrap();
    let mut open_conn = TcpStream::connect(addr).await.unwrap();

    sup.reload(vec![spec(
        39152,
        AnalyzerType::MindrayBs430,
        WireProtocol::Hl7,
    )])
    .await
    .unwrap();

    // The bound set now equals the new spec set.
    assert_eq!(sup.bound_ports(), vec![39152]);

    // The in-flight connection on the removed port is closed promptly.
    let mut buf = [0u8; 1];
    let read = timeout(Duration::from_secs(3), open_conn.read(&mut buf))
        .await
        .expect("old connection should be closed within the drain window");
    assert!(matches!(read, Ok(0) | Err(_)));

    // The old port no longer accepts; the new one does.
    assert!(TcpStream::connect(addr).await.is_err());
    assert!(TcpStream::connect(sup.local_addr(39152).unwrap())
        .await
        .is_ok());

    sup.stop().await;
}

#[tokio::test]
async fn reload_with_same_specs_is_a_no_op() {
    let mut sup = supervisor().await;
    let specs = vec![spec(39153, AnalyzerType::SysmexXnL, WireProtocol::Astm)];

    sup.start(specs.clone()).await.unwrap();
    let addr = sup.local_addr(39153).unwrap();

    // A client connected across an identical reload stays connected.
    let mut conn = TcpStream::connect(addr).await.unwrap();
    sup.reload(specs).await.unwrap();

    assert_eq!(sup.bound_ports(), vec![39153]);
    let mut buf = [0u8; 1];
    let still_open = timeout(Duration::from_millis(300), conn.read(&mut buf)).await;
    assert!(still_open.is_err(), "connection was closed by a no-op reload");

    sup.stop().await;
}

#[tokio::test]
async fn changed_binding_rebinds_the_port() {
    let mut sup = supervisor().await;

    sup.start(vec![spec(39154, AnalyzerType::SysmexXnL, WireProtocol::Astm)])
        .await
        .unwrap();

    // Same port, different analyzer/protocol: must rebind.
    sup.reload(vec![spec(
        39154,
        AnalyzerType::MindrayBs430,
        WireProtocol::Hl7,
    )])
    .await
    .unwrap();

    assert_eq!(sup.bound_ports(), vec![39154]);
    assert!(TcpStream::connect(sup.local_addr(39154).unwrap())
        .await
        .is_ok());

    sup.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent() {
    let mut sup = supervisor().await;
    sup.start(vec![spec(39155, AnalyzerType::SysmexXnL, WireProtocol::Astm)])
        .await
        .unwrap();

    sup.stop().await;
    assert!(sup.bound_ports().is_empty());
    sup.stop().await;
}
