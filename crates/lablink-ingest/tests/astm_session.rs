//! End-to-end ASTM sessions over a real socket: handshake, framing,
//! checksum retransmission, ETB continuations and the persist-then-ACK
//! contract.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use lablink_core::{AnalyzerType, EventBus, ListenerSpec, SyncStatus, WireProtocol};
use lablink_db::{Database, DbConfig};
use lablink_ingest::astm::{encode_frame, ACK, ENQ, EOT, NAK};
use lablink_ingest::{IngestContext, Listener};

async fn start_listener(idle: Duration) -> (Listener, Database) {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let ctx = IngestContext {
        db: db.clone(),
        events: EventBus::new(),
        idle_timeout: idle,
        app_name: "LabLink".into(),
    };
    let spec = ListenerSpec {
        port: 0,
        analyzer_type: AnalyzerType::SysmexXnL,
        protocol: WireProtocol::Astm,
        field_map_id: None,
    };
    let listener = Listener::spawn(spec, ctx).await.unwrap();
    (listener, db)
}

async fn expect_byte(stream: &mut TcpStream, expected: u8) {
    let mut byte = [0u8; 1];
    timeout(Duration::from_secs(5), stream.read_exact(&mut byte))
        .await
        .expect("timed out waiting for reply")
        .expect("read failed");
    assert_eq!(
        byte[0], expected,
        "expected 0x{:02X}, got 0x{:02X}",
        expected, byte[0]
    );
}

async fn send(stream: &mut TcpStream, bytes: &[u8]) {
    stream.write_all(bytes).await.unwrap();
}

#[tokio::test]
async fn astm_happy_path_stores_all_rows_local() {
    let (listener, db) = start_listener(Duration::from_secs(10)).await;
    let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();

    send(&mut stream, &[ENQ]).await;
    expect_byte(&mut stream, ACK).await;

    let records: [&[u8]; 6] = [
        b"H|\\^&|||Sysmex^XN-L",
        b"P|1|322288",
        b"O|1|SID01||^^^GLU",
        b"R|1|^^^GLU|5.3|mmol/L|3.9-6.1|N",
        b"C|1|I|Lipemic sample|G",
        b"L|1|N",
    ];
    for (i, record) in records.iter().enumerate() {
        send(&mut stream, &encode_frame((1 + i as u8) % 8, record, true)).await;
        expect_byte(&mut stream, ACK).await;
    }
    send(&mut stream, &[EOT]).await;

    let patients = db.patients();
    assert_eq!(patients.count().await.unwrap(), 1);
    let patient = patients
        .find_by_identity(AnalyzerType::SysmexXnL, "322288", "")
        .await
        .unwrap()
        .expect("patient stored");
    assert_eq!(patient.external_id, "322288");

    let orders = db.orders().for_patient(patient.id).await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].sample_id, "SID01");

    let results = db.results().for_order(orders[0].id).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].test_code, "GLU");
    assert_eq!(results[0].value, "5.3");
    assert_eq!(results[0].units.as_deref(), Some("mmol/L"));
    assert_eq!(results[0].comments.as_deref(), Some("Lipemic sample"));
    assert_eq!(results[0].sync_status, SyncStatus::Local);
}

#[tokio::test]
async fn checksum_failure_then_retransmit_converges() {
    let (listener, db) = start_listener(Duration::from_secs(10)).await;
    let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();

    send(&mut stream, &[ENQ]).await;
    expect_byte(&mut stream, ACK).await;

    send(&mut stream, &encode_frame(1, b"H|\\^&", true)).await;
    expect_byte(&mut stream, ACK).await;
    send(&mut stream, &encode_frame(2, b"P|1|322288", true)).await;
    expect_byte(&mut stream, ACK).await;

    // Frame 3 with a corrupted checksum digit: NAK, sequence unchanged.
    let mut bad = encode_frame(3, b"O|1|SID01", true);
    let idx = bad.len() - 4;
    bad[idx] = bad[idx].wrapping_add(1);
    send(&mut stream, &bad).await;
    expect_byte(&mut stream, NAK).await;

    // Identical frame with a correct checksum is accepted.
    send(&mut stream, &encode_frame(3, b"O|1|SID01", true)).await;
    expect_byte(&mut stream, ACK).await;

    send(
        &mut stream,
        &encode_frame(4, b"R|1|^^^GLU|5.3|mmol/L", true),
    )
    .await;
    expect_byte(&mut stream, ACK).await;
    send(&mut stream, &encode_frame(5, b"L|1|N", true)).await;
    expect_byte(&mut stream, ACK).await;
    send(&mut stream, &[EOT]).await;

    // Final store equals the happy path.
    assert_eq!(db.patients().count().await.unwrap(), 1);
    assert_eq!(db.results().count_pending().await.unwrap(), 1);
}

#[tokio::test]
async fn large_message_across_etb_continuations() {
    let (listener, db) = start_listener(Duration::from_secs(10)).await;
    let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();

    // Build a >64 KiB message: header, patient, order, many results.
    let mut payload = Vec::new();
    payload.extend_from_slice(b"H|\\^&\rP|1|322288\rO|1|BIG01");
    let mut expected_results = 0;
    while payload.len() < 64 * 1024 {
        expected_results += 1;
        payload.extend_from_slice(
            format!(
                "\rR|{}|^^^T{:05}|{}.0|mmol/L|0-100|N",
                expected_results, expected_results, expected_results
            )
            .as_bytes(),
        );
    }
    payload.extend_from_slice(b"\rL|1|N");

    send(&mut stream, &[ENQ]).await;
    expect_byte(&mut stream, ACK).await;

    // Split into at least 8 frames; all but the last end with ETB.
    let chunks: Vec<&[u8]> = payload.chunks(8000).collect();
    assert!(chunks.len() >= 8, "message must span at least 8 frames");
    let last = chunks.len() - 1;
    for (i, chunk) in chunks.iter().enumerate() {
        let seq = (1 + i as u8) % 8;
        send(&mut stream, &encode_frame(seq, chunk, i == last)).await;
        expect_byte(&mut stream, ACK).await;
    }
    send(&mut stream, &[EOT]).await;

    assert_eq!(
        db.results().count_pending().await.unwrap(),
        expected_results as i64
    );
}

#[tokio::test]
async fn message_without_patient_id_is_nakked_and_not_stored() {
    let (listener, db) = start_listener(Duration::from_secs(10)).await;
    let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();

    send(&mut stream, &[ENQ]).await;
    expect_byte(&mut stream, ACK).await;

    send(&mut stream, &encode_frame(1, b"H|\\^&", true)).await;
    expect_byte(&mut stream, ACK).await;
    send(&mut stream, &encode_frame(2, b"P|1", true)).await;
    expect_byte(&mut stream, ACK).await;
    send(&mut stream, &encode_frame(3, b"R|1|^^^GLU|5.3", true)).await;
    expect_byte(&mut stream, ACK).await;

    // Terminator completes a message with no usable patient identity.
    send(&mut stream, &encode_frame(4, b"L|1|N", true)).await;
    expect_byte(&mut stream, NAK).await;

    assert_eq!(db.patients().count().await.unwrap(), 0);
    assert_eq!(db.results().count_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn idle_connection_is_closed() {
    let (listener, _db) = start_listener(Duration::from_millis(200)).await;
    let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();

    // Say nothing; the receiver hangs up.
    let mut buf = [0u8; 1];
    let read = timeout(Duration::from_secs(3), stream.read(&mut buf))
        .await
        .expect("receiver should close the idle connection");
    assert_eq!(read.unwrap(), 0);
}

#[tokio::test]
async fn empty_result_value_is_preserved() {
    let (listener, db) = start_listener(Duration::from_secs(10)).await;
    let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();

    send(&mut stream, &[ENQ]).await;
    expect_byte(&mut stream, ACK).await;

    for (i, record) in [
        b"H|\\^&".as_slice(),
        b"P|1|322288",
        b"O|1|S9",
        b"R|1|^^^WBC|",
        b"L|1|N",
    ]
    .iter()
    .enumerate()
    {
        send(&mut stream, &encode_frame((1 + i as u8) % 8, record, true)).await;
        expect_byte(&mut stream, ACK).await;
    }

    let batch = db
        .results()
        .pending_batch(10, chrono::Utc::now())
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].result.test_code, "WBC");
    assert_eq!(batch[0].result.value, "");
}
