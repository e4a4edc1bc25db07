use nexio::{BoxError, Connection, Outcome, Protocol, Server, ServerBuilder};

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::Duration;

/// Echoes lines; `!` rejects with a reason, `~` rejects without one,
/// `?` fails and `#` panics.
struct Strict;

impl Protocol for Strict {
    fn process(&self, conn: &mut Connection) -> Result<Outcome, BoxError> {
        let Some(end) = conn.input().find(b"\n") else {
            return Ok(Outcome::Incomplete);
        };

        let line = conn.input_mut().take(end + 1).unwrap_or_default().to_vec();
        conn.write(&line);

        match line[0] {
            b'!' => Ok(Outcome::protocol_error("ERR\n")),
            b'~' => Ok(Outcome::ProtocolError(None)),
            b'?' => Err("backend unavailable".into()),
            b'#' => panic!("handler bug"),
            _ => Ok(Outcome::Complete),
        }
    }
}

fn start() -> Server {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let config = ServerBuilder::new()
        .address("127.0.0.1:0")
        .workers(1)
        .build()
        .expect("Failed to build server config");

    Server::start(config, Arc::new(Strict)).expect("Failed to start server")
}

fn connect(server: &Server) -> TcpStream {
    let stream = TcpStream::connect(server.local_addr()).expect("Failed to connect to server");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("Failed to set read timeout");
    stream
}

/// Reads until the server closes the connection.
fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();

    match stream.read_to_end(&mut received) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::ConnectionReset => {}
        Err(e) => panic!("Failed to read from stream: {e}"),
    }

    received
}

#[test]
fn test_protocol_error_sends_one_response_then_closes() {
    let server = start();
    let mut stream = connect(&server);

    stream
        .write_all(b"ok\n!bad\nnever\n")
        .expect("Failed to write to stream");

    assert_eq!(read_until_closed(&mut stream), b"ok\nERR\n");
}

#[test]
fn test_protocol_error_without_reason_sends_generic_message() {
    let server = start();
    let mut stream = connect(&server);

    stream.write_all(b"~\n").expect("Failed to write to stream");

    assert_eq!(read_until_closed(&mut stream), b"Protocol error!");
}

#[test]
fn test_failure_closes_without_response() {
    let server = start();
    let mut stream = connect(&server);

    stream.write_all(b"?\n").expect("Failed to write to stream");

    assert!(read_until_closed(&mut stream).is_empty());
}

#[test]
fn test_panic_closes_connection_and_worker_survives() {
    let server = start();

    let mut first = connect(&server);
    first.write_all(b"#\n").expect("Failed to write to stream");
    assert!(read_until_closed(&mut first).is_empty());

    let mut second = connect(&server);
    second.write_all(b"still here\n").expect("Failed to write to stream");

    let mut buffer = [0; 11];
    second
        .read_exact(&mut buffer)
        .expect("Failed to read from stream");
    assert_eq!(&buffer, b"still here\n");
}

#[test]
fn test_responses_are_flushed_after_peer_stops_sending() {
    let server = start();

    for _ in 0..20 {
        let mut stream = connect(&server);
        stream.write_all(b"!bad\n").expect("Failed to write to stream");
        stream
            .shutdown(Shutdown::Write)
            .expect("Failed to shut down write side");

        assert_eq!(read_until_closed(&mut stream), b"ERR\n");

        let mut stream = connect(&server);
        stream.write_all(b"ok\n").expect("Failed to write to stream");
        stream
            .shutdown(Shutdown::Write)
            .expect("Failed to shut down write side");

        assert_eq!(read_until_closed(&mut stream), b"ok\n");
    }
}
