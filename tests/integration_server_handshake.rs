//! The full client/server handshake over a real control channel: a `conf`
//! exchange followed by `quit`, which must bring the server loop down.

use clap::Parser;
use netmark::cli::Args;
use netmark::registry::{run_client, run_server, ServerConfig};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

/// Grab a port the OS considers free right now.
fn pick_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe socket");
    listener.local_addr().expect("probe addr").port()
}

#[test]
fn conf_and_quit_round_trip() {
    let port = pick_port();
    let server = thread::spawn(move || run_server(&ServerConfig { listen_port: port }));

    // Give the server thread time to bind before the client connects.
    thread::sleep(Duration::from_millis(300));

    netmark::clock::install_alarm_handler().expect("install alarm handler");

    let args = Args::parse_from([
        "netmark",
        "--remote-port",
        &port.to_string(),
        "127.0.0.1",
        "conf",
        "quit",
    ]);
    run_client(&args.to_client_config().expect("client config")).expect("conf+quit run");

    // quit must terminate the server loop cleanly.
    server.join().expect("server thread").expect("server result");
}
