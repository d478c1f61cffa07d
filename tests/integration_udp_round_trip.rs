//! End-to-end UDP ping-pong latency over loopback, terminated by the real
//! duration alarm. Send and receive counts on the client stay within one of
//! each other: a lost echo stalls the volley rather than skewing it.

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
fn udp_latency_loopback_smoke() {
    let port = pick_port();
    let server = thread::spawn(move || run_server(&ServerConfig { listen_port: port }));
    thread::sleep(Duration::from_millis(300));

    netmark::clock::install_alarm_handler().expect("install alarm handler");

    let dir = tempfile::tempdir().expect("tempdir");
    let json_path = dir.path().join("results.json");

    let args = Args::parse_from([
        "netmark",
        "--remote-port",
        &port.to_string(),
        "-t",
        "1",
        "-M",
        "1",
        "--output-json",
        json_path.to_str().unwrap(),
        "127.0.0.1",
        "udp_lat",
        "quit",
    ]);
    run_client(&args.to_client_config().expect("client config")).expect("udp_lat run");
    server.join().expect("server thread").expect("server result");

    let contents = std::fs::read_to_string(&json_path).expect("read results");
    let record: serde_json::Value =
        serde_json::from_str(contents.lines().next().expect("one record")).expect("json");

    assert_eq!(record["test"], "udp_lat");
    assert!(record["duration_s"].as_f64().unwrap() > 0.5);

    let stats = &record["stats"];
    let sent = stats["s"]["no_msgs"].as_u64().unwrap();
    let received = stats["r"]["no_msgs"].as_u64().unwrap();
    assert!(sent > 0, "no messages sent in a one second run");
    assert!(received > 0, "no echoes received in a one second run");
    assert!(
        sent.abs_diff(received) <= 1,
        "ping-pong counts diverged: {} sent, {} received",
        sent,
        received
    );
}
