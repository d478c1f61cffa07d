//! End-to-end TCP bandwidth over loopback: message-capped so the run is
//! deterministic, with the JSON record checked against the exchanged
//! statistics. Mirrors the first end-to-end scenario of the protocol: the
//! remote receive counters must equal the local send counters.

use clap::Parser;
use netmark::cli::Args;
use netmark::registry::{run_client, run_server, ServerConfig};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

fn pick_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe socket");
    listener.local_addr().expect("probe addr").port()
}

#[test]
fn tcp_bandwidth_loopback_smoke() {
    let port = pick_port();
    let data_port = pick_port();
    let server = thread::spawn(move || run_server(&ServerConfig { listen_port: port }));
    thread::sleep(Duration::from_millis(300));

    netmark::clock::install_alarm_handler().expect("install alarm handler");

    let dir = tempfile::tempdir().expect("tempdir");
    let json_path = dir.path().join("results.json");

    // A zero duration arms no alarm; the message cap bounds the run and the
    // resulting end-of-file stops the receiver, so the test is exact.
    // Pinning the data port exercises the client-side acceptance of the
    // server-honored `port` parameter.
    let args = Args::parse_from([
        "netmark",
        "--remote-port",
        &port.to_string(),
        "--port",
        &data_port.to_string(),
        "-t",
        "0",
        "--no-msgs",
        "2000",
        "-M",
        "65536",
        "--output-json",
        json_path.to_str().unwrap(),
        "127.0.0.1",
        "tcp_bw",
        "quit",
    ]);
    run_client(&args.to_client_config().expect("client config")).expect("tcp_bw run");
    server.join().expect("server thread").expect("server result");

    let contents = std::fs::read_to_string(&json_path).expect("read results");
    let record: serde_json::Value =
        serde_json::from_str(contents.lines().next().expect("one record")).expect("json");

    assert_eq!(record["test"], "tcp_bw");
    assert!(record["duration_s"].as_f64().unwrap() > 0.0);

    let stats = &record["stats"];
    let sent_msgs = stats["s"]["no_msgs"].as_u64().unwrap();
    let sent_bytes = stats["s"]["no_bytes"].as_u64().unwrap();
    assert_eq!(sent_msgs, 2000);
    assert_eq!(sent_bytes, 2000 * 65536);
    assert_eq!(stats["s"]["no_errs"].as_u64().unwrap(), 0);

    // The peer observed exactly what was sent.
    assert_eq!(stats["rem_r"]["no_msgs"].as_u64().unwrap(), sent_msgs);
    assert_eq!(stats["rem_r"]["no_bytes"].as_u64().unwrap(), sent_bytes);
}
