//! Common test utilities for rmaperf integration tests.

#![allow(dead_code)]

use std::thread;

use rmaperf::MAX_WR;
use softverbs::{Connection, ConnectionConfig, Listener};

pub fn config() -> ConnectionConfig {
    ConnectionConfig::default()
        .with_max_send_wr(MAX_WR)
        .with_max_recv_wr(MAX_WR)
}

/// Connect two endpoints over loopback.
///
/// Returns `(client, server)`.
pub fn connected_pair() -> (Connection, Connection) {
    let config = config();
    let listener = Listener::bind_addr("127.0.0.1:0", &config).expect("bind");
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || listener.accept().expect("accept"));
    let client = Connection::connect("127.0.0.1", port, &config).expect("connect");
    let server = server.join().unwrap();
    (client, server)
}

/// Run `client` and `server` on their own threads over a fresh loopback
/// connection. Each side's connection is dropped as soon as its closure
/// returns, like a process exiting.
pub fn run_pair<A, B, F, G>(client: F, server: G) -> (A, B)
where
    A: Send + 'static,
    B: Send + 'static,
    F: FnOnce(&Connection) -> A + Send + 'static,
    G: FnOnce(&Connection) -> B + Send + 'static,
{
    let (client_conn, server_conn) = connected_pair();
    let server = thread::spawn(move || {
        let out = server(&server_conn);
        drop(server_conn);
        out
    });
    let client = thread::spawn(move || {
        let out = client(&client_conn);
        drop(client_conn);
        out
    });
    (client.join().unwrap(), server.join().unwrap())
}
