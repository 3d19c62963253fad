//! A termination signal abandons a reply that is still being written.

use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;

use tradestore_core::builder::IndexBuilder;
use tradestore_core::layout::StoreLayout;
use tradestore_core::query::SearchRequest;
use tradestore_core::record::{self, Record};
use tradestore_core::server::{self, ServeStats, Server, ServerState, Shutdown};
use tradestore_core::settings::Settings;
use tradestore_core::wire;

const RECORDS: u32 = 1000;

fn record(slot: u32) -> Record {
    Record {
        captured_at: "2024-11-02 08:15:00".to_string(),
        slot,
        tx_idx: 0,
        signing_wallet: format!("wallet{}", slot % 7),
        direction: "buy".to_string(),
        base_coin: "PUMPcoin".to_string(),
        signature: format!("sig{}", slot),
        ..Record::default()
    }
}

#[test]
fn sigterm_abandons_a_reply_the_client_is_not_reading() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.storage.data_dir = dir.path().to_string_lossy().into_owned();
    settings.server.request_pipe = dir.path().join("requests").to_string_lossy().into_owned();
    settings.server.response_pipe_template =
        dir.path().join("reply_{pid}").to_string_lossy().into_owned();

    let layout = StoreLayout::from_settings(&settings.storage);
    let mut builder = IndexBuilder::create(&layout, 100).unwrap();
    for slot in 0..RECORDS {
        builder.append(&record(slot)).unwrap();
    }
    builder.finish().unwrap();
    // Far larger than a pipe buffer.
    let full_reply = 4 + RECORDS as usize * record::RECORD_SIZE;

    let shutdown = Shutdown::install_signal_handlers().unwrap();
    let server = Server::bind(ServerState::load(&settings).unwrap()).unwrap();
    let request_pipe = server.request_pipe().to_path_buf();

    let (tx, rx) = std::sync::mpsc::channel();
    let handle = std::thread::spawn(move || -> anyhow::Result<ServeStats> {
        tx.send(nix::sys::pthread::pthread_self()).unwrap();
        server.run(&shutdown)
    });
    let server_thread = rx.recv().unwrap();

    let client_pid = std::process::id() as i32;
    let reply_path = settings.server.response_pipe(client_pid);
    server::create_fifo(&reply_path).unwrap();
    // Held open but never read while the server writes.
    let mut reply = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(nix::fcntl::OFlag::O_NONBLOCK.bits())
        .open(&reply_path)
        .unwrap();

    let frame = wire::encode_request(client_pid, &SearchRequest::default()).unwrap();
    std::fs::OpenOptions::new()
        .write(true)
        .open(&request_pipe)
        .unwrap()
        .write_all(&frame)
        .unwrap();

    std::thread::sleep(std::time::Duration::from_millis(300));
    nix::sys::pthread::pthread_kill(server_thread, nix::sys::signal::Signal::SIGTERM).unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while !handle.is_finished() && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    assert!(handle.is_finished(), "server kept writing after SIGTERM");

    let stats = handle.join().unwrap().unwrap();
    assert_eq!(stats, ServeStats { served: 0, failed: 1 });
    assert!(!request_pipe.exists());

    let mut received = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reply.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => panic!("reading reply: {}", e),
        }
    }
    assert!(received.len() < full_reply, "got the full {} byte reply", received.len());

    std::fs::remove_file(&reply_path).unwrap();
}
