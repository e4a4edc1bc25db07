use nexio::{BoxError, Connection, Outcome, Protocol, Server, ServerBuilder};

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Answers `slow` lines from a background thread, everything else inline.
struct Deferred;

/// Per-connection marker of a pending background answer.
struct Pending(Arc<AtomicBool>);

impl Protocol for Deferred {
    fn process(&self, conn: &mut Connection) -> Result<Outcome, BoxError> {
        if let Some(Pending(ready)) = conn.attachment::<Pending>() {
            if !ready.load(Ordering::Acquire) {
                conn.set_async();
                return Ok(Outcome::Complete);
            }

            conn.take_attachment::<Pending>();
            conn.write(b"SLOW\n");
            return Ok(Outcome::Complete);
        }

        let Some(end) = conn.input().find(b"\n") else {
            return Ok(Outcome::Incomplete);
        };
        let line = conn.input_mut().take(end + 1).unwrap_or_default().to_vec();

        if line == b"slow\n" {
            let ready = Arc::new(AtomicBool::new(false));
            conn.attach(Pending(ready.clone()));

            let handle = conn.set_async();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                ready.store(true, Ordering::Release);
                handle.resume().expect("Failed to resume connection");
            });
        } else {
            conn.write(&line.to_ascii_uppercase());
        }

        Ok(Outcome::Complete)
    }
}

fn start() -> Server {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let config = ServerBuilder::new()
        .address("127.0.0.1:0")
        .workers(1)
        .build()
        .expect("Failed to build server config");

    Server::start(config, Arc::new(Deferred)).expect("Failed to start server")
}

fn connect(server: &Server) -> TcpStream {
    let stream = TcpStream::connect(server.local_addr()).expect("Failed to connect to server");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("Failed to set read timeout");
    stream
}

#[test]
fn test_async_response_is_not_overtaken() {
    let server = start();
    let mut stream = connect(&server);

    stream
        .write_all(b"slow\nfast\n")
        .expect("Failed to write to stream");

    let mut buffer = [0; 10];
    stream
        .read_exact(&mut buffer)
        .expect("Failed to read from stream");
    assert_eq!(&buffer, b"SLOW\nFAST\n");
}

#[test]
fn test_input_buffered_while_async_is_processed_after_resume() {
    let server = start();
    let mut stream = connect(&server);

    stream.write_all(b"slow\n").expect("Failed to write to stream");
    thread::sleep(Duration::from_millis(20));
    stream.write_all(b"a\nb\n").expect("Failed to write to stream");

    let mut buffer = [0; 9];
    stream
        .read_exact(&mut buffer)
        .expect("Failed to read from stream");
    assert_eq!(&buffer, b"SLOW\nA\nB\n");
}

#[test]
fn test_async_connections_do_not_block_others() {
    let server = start();
    let mut slow = connect(&server);
    let mut fast = connect(&server);

    slow.write_all(b"slow\n").expect("Failed to write to stream");
    fast.write_all(b"ping\n").expect("Failed to write to stream");

    let mut buffer = [0; 5];
    fast.read_exact(&mut buffer)
        .expect("Failed to read from stream");
    assert_eq!(&buffer, b"PING\n");

    slow.read_exact(&mut buffer)
        .expect("Failed to read from stream");
    assert_eq!(&buffer, b"SLOW\n");
}
