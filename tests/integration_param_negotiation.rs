//! A user-supplied parameter that no driver of the selected test consumes
//! must fail the test with "not applicable", on the client before the
//! barrier and on the server after it adopts the request.

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
fn inapplicable_parameter_is_refused() {
    let port = pick_port();
    let server = thread::spawn(move || run_server(&ServerConfig { listen_port: port }));
    thread::sleep(Duration::from_millis(300));

    netmark::clock::install_alarm_handler().expect("install alarm handler");

    // --rd-atomic has no meaning for a TCP test.
    let args = Args::parse_from([
        "netmark",
        "--remote-port",
        &port.to_string(),
        "-t",
        "0",
        "--no-msgs",
        "10",
        "--rd-atomic",
        "16",
        "127.0.0.1",
        "tcp_bw",
    ]);
    let err = run_client(&args.to_client_config().expect("client config"))
        .expect_err("rd_atomic must not apply to tcp_bw");
    assert!(
        format!("{:#}", err).contains("not applicable"),
        "unexpected error: {:#}",
        err
    );

    // The server survives a refused test and still honors quit.
    let args = Args::parse_from([
        "netmark",
        "--remote-port",
        &port.to_string(),
        "127.0.0.1",
        "quit",
    ]);
    run_client(&args.to_client_config().expect("client config")).expect("quit run");
    server.join().expect("server thread").expect("server result");
}
