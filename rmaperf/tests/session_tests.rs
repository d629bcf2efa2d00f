//! End-to-end sessions over loopback softverbs.
//!
//! Covers digest agreement for every verb, the MR count mismatch, the
//! throughput signaling pattern and the ping-pong benchmark.
//!
//! Run with:
//! ```bash
//! cargo test -p rmaperf --test session_tests
//! ```

mod common;

use rmaperf::{
    BusySpin, Error, Mode, MonotonicClock, Role, SessionParams, Verb, run_client,
    run_pingpong_on, run_server,
};

use common::run_pair;

fn run_session(params: SessionParams) -> (rmaperf::SessionOutcome, rmaperf::SessionOutcome) {
    params.validate().unwrap();
    let server_params = params.clone();
    let (client, server) = run_pair(
        move |conn| run_client(conn, &params, &MonotonicClock::new(), &mut BusySpin),
        move |conn| run_server(conn, &server_params, &MonotonicClock::new(), &mut BusySpin),
    );
    (client.unwrap(), server.unwrap())
}

#[test]
fn test_write_session_digests_match() {
    let params = SessionParams::new()
        .with_verb(Verb::Write)
        .with_count(64)
        .with_length(32)
        .with_mr_count(4)
        .with_repeat(2);
    let (client, server) = run_session(params);

    assert_eq!(client.failures, 0);
    assert_eq!(client.exit_status(), 0);
    assert_eq!(client.rounds.len(), 2);
    let latency = client.rounds[1].latency.as_ref().unwrap();
    assert_eq!(latency.iterations, 64);
    assert_eq!(latency.length, 32);
    assert_eq!(client.digest, server.digest);
    assert_eq!(client.digest.count, 64);
}

#[test]
fn test_read_session_digests_match() {
    let params = SessionParams::new()
        .with_verb(Verb::Read)
        .with_count(32)
        .with_length(128)
        .with_mr_count(2);
    let (client, server) = run_session(params);

    assert_eq!(client.failures, 0);
    assert_eq!(client.digest, server.digest);
}

#[test]
fn test_send_session_digests_match() {
    let params = SessionParams::new()
        .with_verb(Verb::Send)
        .with_count(48)
        .with_length(16)
        .with_warmup(8)
        .with_mode(Mode::Throughput)
        .with_signal_interval(4);
    let (client, server) = run_session(params);

    assert_eq!(client.failures, 0);
    assert_eq!(server.failures, 0);
    let throughput = client.rounds[0].throughput.unwrap();
    assert_eq!(throughput.bytes, 40 * 16);
    assert!(throughput.gbits_per_sec > 0.0);
    assert_eq!(client.digest, server.digest);
}

#[test]
fn test_throughput_signals_interval_and_last() {
    let params = SessionParams::new()
        .with_verb(Verb::Write)
        .with_count(10)
        .with_length(8)
        .with_mode(Mode::Throughput)
        .with_signal_interval(4);
    let (client, _server) = run_session(params);

    let records = &client.rounds[0].records;
    let ended: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.end.is_some())
        .map(|(n, _)| n)
        .collect();
    assert_eq!(ended, vec![0, 4, 8, 9]);
    assert!(records.iter().all(|r| r.start > 0));
    assert!(client.rounds[0].throughput.is_some());
}

#[test]
fn test_count_mismatch_fails_handshake() {
    let client_params = SessionParams::new().with_verb(Verb::Write).with_count(100);
    let server_params = SessionParams::new().with_verb(Verb::Write).with_count(50);

    let (client, server) = run_pair(
        move |conn| run_client(conn, &client_params, &MonotonicClock::new(), &mut BusySpin),
        move |conn| run_server(conn, &server_params, &MonotonicClock::new(), &mut BusySpin),
    );

    assert!(matches!(
        client.unwrap_err(),
        Error::CountMismatch {
            local: 100,
            remote: 50
        }
    ));
    // The client hung up before the array was delivered.
    assert!(server.is_err());
}

#[test]
fn test_pingpong_round_trips() {
    let params = SessionParams::new()
        .with_length(16)
        .with_repeat(50)
        .with_signal_interval(8);
    let server_params = params.clone();

    let (client, server) = run_pair(
        move |conn| {
            let role = Role::Client {
                host: "127.0.0.1".into(),
            };
            run_pingpong_on(conn, &role, &params, &MonotonicClock::new(), &mut BusySpin)
        },
        move |conn| {
            run_pingpong_on(
                conn,
                &Role::Server,
                &server_params,
                &MonotonicClock::new(),
                &mut BusySpin,
            )
        },
    );
    let client = client.unwrap();
    let server = server.unwrap();

    assert_eq!(server.spans.len(), 50);
    assert!(server.spans.iter().all(|&(start, end)| end > start));
    assert_eq!(server.latency.as_ref().unwrap().iterations, 50);
    assert!(client.spans.is_empty());
    assert!(client.latency.is_none());

    assert_eq!(client.received, server.sent);
    assert_eq!(server.received, client.sent);
    assert_eq!(server.sent.count, 50);
}

#[test]
fn test_pingpong_rejects_short_requests() {
    let params = SessionParams::new().with_length(4).with_repeat(1);
    let (client, server) = run_pair(
        {
            let params = params.clone();
            move |conn| {
                let role = Role::Client {
                    host: "127.0.0.1".into(),
                };
                run_pingpong_on(conn, &role, &params, &MonotonicClock::new(), &mut BusySpin)
            }
        },
        move |conn| {
            run_pingpong_on(
                conn,
                &Role::Server,
                &params,
                &MonotonicClock::new(),
                &mut BusySpin,
            )
        },
    );
    assert!(matches!(client.unwrap_err(), Error::InvalidConfig(_)));
    assert!(matches!(server.unwrap_err(), Error::InvalidConfig(_)));
}
