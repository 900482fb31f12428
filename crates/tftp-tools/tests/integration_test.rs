//! Integration tests for tftpd and the tftp client
//!
//! These tests start the actual server on loopback and talk to it with the
//! client library or with raw UDP sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tftp::{
    ActiveSessions, ByteStore, DirStore, DispatchMode, LockPolicy, MAX_PACKET_SIZE, MemoryStore, Packet, TftpClient,
    TftpServer, TftpServerConfig, TransferConfig, TransferError,
};
use tokio::fs;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

fn transfer_config(timeout: Duration, max_retries: usize) -> TransferConfig {
    TransferConfig { timeout, max_retries }
}

async fn start_server<S: ByteStore>(
    dispatch: DispatchMode,
    transfer: TransferConfig,
    store: S,
) -> (SocketAddr, Arc<ActiveSessions>) {
    let config = TftpServerConfig {
        dispatch,
        transfer,
        ..loopback_config()
    };
    start_with_config(config, store).await
}

fn loopback_config() -> TftpServerConfig {
    TftpServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        ..Default::default()
    }
}

async fn start_with_config<S: ByteStore>(config: TftpServerConfig, store: S) -> (SocketAddr, Arc<ActiveSessions>) {
    let server = TftpServer::bind(config, store).await.unwrap();
    let addr = server.local_addr().unwrap();
    let sessions = server.sessions();
    tokio::spawn(server.serve());
    (addr, sessions)
}

/// Deterministic content that includes zero bytes
fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

async fn collect_datagrams(sock: &UdpSocket, quiet: Duration) -> Vec<Vec<u8>> {
    let mut received = Vec::new();
    let mut buf = [0u8; MAX_PACKET_SIZE];
    while let Ok(Ok((n, _))) = timeout(quiet, sock.recv_from(&mut buf)).await {
        received.push(buf[..n].to_vec());
    }
    received
}

async fn round_trip(dispatch: DispatchMode) {
    let server_dir = tempdir().unwrap();
    let client_dir = tempdir().unwrap();
    let transfer = transfer_config(Duration::from_millis(500), 5);
    let (addr, sessions) = start_server(dispatch, transfer, DirStore::new(server_dir.path())).await;

    let client = TftpClient::new(addr, transfer);
    let local = DirStore::new(client_dir.path());

    let mut binary = vec![0u8; 1500];
    binary[700] = 0xff;
    binary[1499] = 1;
    let cases = [
        ("empty.bin", Vec::new()),
        ("short.bin", content(511)),
        ("exact.bin", content(512)),
        ("three.bin", content(1025)),
        ("zeros.bin", binary),
    ];

    for (name, bytes) in &cases {
        fs::write(client_dir.path().join(name), bytes).await.unwrap();
        let sent = client.put(&local, name, name).await.unwrap();
        assert_eq!(sent.bytes, bytes.len() as u64, "put {name}");
        assert_eq!(sent.blocks, (bytes.len() / 512 + 1) as u64, "put {name}");

        let copy = format!("{name}.copy");
        let received = client.get(&local, name, &copy).await.unwrap();
        assert_eq!(received.bytes, bytes.len() as u64, "get {name}");

        let stored = fs::read(server_dir.path().join(name)).await.unwrap();
        let fetched = fs::read(client_dir.path().join(&copy)).await.unwrap();
        assert_eq!(&stored, bytes, "server copy of {name}");
        assert_eq!(&fetched, bytes, "client copy of {name}");
    }

    sleep(Duration::from_millis(50)).await;
    assert!(sessions.is_empty());
}

#[tokio::test]
async fn test_round_trip_threaded() {
    round_trip(DispatchMode::Threaded).await;
}

#[tokio::test]
async fn test_round_trip_serial() {
    round_trip(DispatchMode::Serial).await;
}

#[tokio::test]
async fn test_missing_file_single_error_no_local_file() {
    let server_dir = tempdir().unwrap();
    let client_dir = tempdir().unwrap();
    let transfer = transfer_config(Duration::from_millis(200), 3);
    let (addr, _) = start_server(DispatchMode::Threaded, transfer, DirStore::new(server_dir.path())).await;

    // Raw request: exactly one error and nothing after it
    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    raw.send_to(&Packet::read_request("nope.bin").encode().unwrap(), addr)
        .await
        .unwrap();
    let replies = collect_datagrams(&raw, Duration::from_millis(700)).await;
    assert_eq!(replies.len(), 1);
    assert!(matches!(Packet::decode(&replies[0]).unwrap(), Packet::Error { code: 1, .. }));

    // Client: the error surfaces and no local file is created
    let client = TftpClient::new(addr, transfer);
    let result = client.get(&DirStore::new(client_dir.path()), "nope.bin", "nope.bin").await;
    assert!(matches!(result, Err(TransferError::PeerError { code: 1, .. })));
    assert!(!client_dir.path().join("nope.bin").exists());
}

#[tokio::test]
async fn test_path_traversal_refused() {
    let root = tempdir().unwrap();
    let outside = root.path().join("secret.txt");
    fs::write(&outside, b"secret").await.unwrap();
    let served = root.path().join("served");
    fs::create_dir(&served).await.unwrap();

    let transfer = transfer_config(Duration::from_millis(200), 3);
    let (addr, _) = start_server(DispatchMode::Threaded, transfer, DirStore::new(&served)).await;

    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    raw.send_to(&Packet::read_request("../secret.txt").encode().unwrap(), addr)
        .await
        .unwrap();
    let replies = collect_datagrams(&raw, Duration::from_millis(500)).await;
    assert_eq!(replies.len(), 1);
    assert!(matches!(Packet::decode(&replies[0]).unwrap(), Packet::Error { code: 2, .. }));
}

#[tokio::test]
async fn test_timeout_releases_session_resources() {
    let store = MemoryStore::new();
    store.insert("big.bin", content(4096));
    let transfer = transfer_config(Duration::from_millis(100), 3);
    let (addr, sessions) = start_server(DispatchMode::Threaded, transfer, store.clone()).await;

    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    raw.send_to(&Packet::read_request("big.bin").encode().unwrap(), addr)
        .await
        .unwrap();

    // Never acknowledge: block 1 is sent exactly max_retries times
    let copies = collect_datagrams(&raw, Duration::from_millis(500)).await;
    assert_eq!(copies.len(), 3);
    assert!(copies.iter().all(|c| c == &copies[0]));
    assert!(matches!(Packet::decode(&copies[0]).unwrap(), Packet::Data { block: 1, .. }));

    sleep(Duration::from_millis(50)).await;
    assert_eq!(sessions.len(), 0);
    assert_eq!(store.open_handles(), 0);
}

#[tokio::test]
async fn test_concurrent_transfers_are_independent() {
    let store = MemoryStore::new();
    let first = content(5000);
    let second: Vec<u8> = content(7000).into_iter().map(|b| b ^ 0x5a).collect();
    store.insert("first.bin", first.clone());
    store.insert("second.bin", second.clone());

    let transfer = transfer_config(Duration::from_millis(500), 5);
    let (addr, _) = start_server(DispatchMode::Threaded, transfer, store).await;

    let local = MemoryStore::new();
    let client = TftpClient::new(addr, transfer);
    let (a, b) = tokio::join!(
        client.get(&local, "first.bin", "first.bin"),
        client.get(&local, "second.bin", "second.bin"),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(local.get("first.bin").unwrap(), first);
    assert_eq!(local.get("second.bin").unwrap(), second);
}

#[tokio::test]
async fn test_upload_while_reading_other_file() {
    let store = MemoryStore::new();
    store.insert("download.bin", content(3000));
    let transfer = transfer_config(Duration::from_millis(500), 5);
    let (addr, _) = start_server(DispatchMode::Threaded, transfer, store.clone()).await;

    let local = MemoryStore::new();
    let upload = content(2048);
    local.insert("upload.bin", upload.clone());

    let client = TftpClient::new(addr, transfer);
    let (put, get) = tokio::join!(
        client.put(&local, "upload.bin", "upload.bin"),
        client.get(&local, "download.bin", "download.bin"),
    );
    put.unwrap();
    get.unwrap();

    assert_eq!(store.get("upload.bin").unwrap(), upload);
    assert_eq!(local.get("download.bin").unwrap(), content(3000));
}

async fn concurrent_uploads(lock_policy: LockPolicy) {
    let config = TftpServerConfig {
        dispatch: DispatchMode::Threaded,
        transfer: transfer_config(Duration::from_millis(500), 5),
        lock_policy,
        ..loopback_config()
    };
    let store = MemoryStore::new();
    let (addr, sessions) = start_with_config(config.clone(), store.clone()).await;

    let local = MemoryStore::new();
    let first = content(5000);
    let second: Vec<u8> = content(7000).into_iter().map(|b| b ^ 0xa5).collect();
    local.insert("first.bin", first.clone());
    local.insert("second.bin", second.clone());

    let client = TftpClient::new(addr, config.transfer);
    let (a, b) = tokio::join!(
        client.put(&local, "first.bin", "first.bin"),
        client.put(&local, "second.bin", "second.bin"),
    );
    assert_eq!(a.unwrap().blocks, 10, "{lock_policy} locking");
    assert_eq!(b.unwrap().blocks, 14, "{lock_policy} locking");

    sleep(Duration::from_millis(50)).await;
    assert_eq!(store.get("first.bin").unwrap(), first, "{lock_policy} locking");
    assert_eq!(store.get("second.bin").unwrap(), second, "{lock_policy} locking");
    assert!(sessions.is_empty());
    assert_eq!(store.open_handles(), 0);
}

#[tokio::test]
async fn test_concurrent_uploads_global_lock() {
    concurrent_uploads(LockPolicy::Global).await;
}

#[tokio::test]
async fn test_concurrent_uploads_per_resource_lock() {
    concurrent_uploads(LockPolicy::PerResource).await;
}

#[tokio::test]
async fn test_put_missing_local_file() {
    let transfer = transfer_config(Duration::from_millis(200), 3);
    let (addr, _) = start_server(DispatchMode::Serial, transfer, MemoryStore::new()).await;

    let client = TftpClient::new(addr, transfer);
    let result = client.put(&MemoryStore::new(), "absent.bin", "absent.bin").await;
    assert!(matches!(result, Err(TransferError::FileNotFound(_))));
}
