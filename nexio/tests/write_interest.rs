use nexio::{
    BoxError, Connection, ConnectionRef, Outcome, Protocol, Worker, WorkerConfig, WorkerHandle,
};

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const BIG: usize = 4 * 1024 * 1024;

/// Echoes lines, answers `big` with a large payload and remembers the
/// identity of the last connection it saw.
#[derive(Default)]
struct Recorder {
    last: Mutex<Option<ConnectionRef>>,
}

impl Protocol for Recorder {
    fn process(&self, conn: &mut Connection) -> Result<Outcome, BoxError> {
        *self.last.lock().unwrap() = Some(conn.handle());

        let Some(end) = conn.input().find(b"\n") else {
            return Ok(Outcome::Incomplete);
        };
        let line = conn.input_mut().take(end + 1).unwrap_or_default().to_vec();

        if line == b"big\n" {
            let payload: Vec<u8> = (0..BIG).map(|i| (i % 251) as u8).collect();
            conn.write(&payload);
        } else {
            conn.write(&line);
        }

        Ok(Outcome::Complete)
    }
}

struct Fixture {
    worker: Worker,
    protocol: Arc<Recorder>,
    listener: TcpListener,
    addr: SocketAddr,
}

impl Fixture {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let protocol = Arc::new(Recorder::default());
        let config = WorkerConfig {
            name: String::from("write-interest"),
            ..WorkerConfig::default()
        };
        let worker = Worker::spawn(config, protocol.clone()).expect("Failed to spawn worker");

        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
        let addr = listener.local_addr().expect("Failed to get local address");

        Self {
            worker,
            protocol,
            listener,
            addr,
        }
    }

    /// Connects a client and hands the accepted side to the worker.
    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).expect("Failed to connect to listener");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("Failed to set read timeout");

        let (accepted, _) = self.listener.accept().expect("Failed to accept connection");
        self.worker
            .handle()
            .accept(accepted)
            .expect("Failed to hand over connection");

        stream
    }

    fn connection(&self) -> ConnectionRef {
        self.protocol
            .last
            .lock()
            .unwrap()
            .expect("Protocol never ran")
    }
}

fn echo(stream: &mut TcpStream, message: &[u8]) {
    stream.write_all(message).expect("Failed to write to stream");

    let mut buffer = vec![0; message.len()];
    stream
        .read_exact(&mut buffer)
        .expect("Failed to read from stream");
    assert_eq!(buffer, message);
}

#[test]
fn test_large_response_is_flushed_across_write_events() {
    let fixture = Fixture::new();
    let mut stream = fixture.connect();

    stream.write_all(b"big\n").expect("Failed to write to stream");

    // Let the kernel buffers fill up before draining them.
    thread::sleep(Duration::from_millis(100));

    let mut received = vec![0; BIG];
    stream
        .read_exact(&mut received)
        .expect("Failed to read from stream");

    assert!(received.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));

    echo(&mut stream, b"after\n");
}

#[test]
fn test_concurrent_write_requests_keep_connection_usable() {
    let fixture = Fixture::new();
    let mut stream = fixture.connect();

    echo(&mut stream, b"first\n");
    let conn = fixture.connection();

    let requesters: Vec<_> = (0..8)
        .map(|_| {
            let handle: WorkerHandle = fixture.worker.handle();
            thread::spawn(move || {
                for _ in 0..1000 {
                    handle.want_to_write(conn).expect("Failed to request write");
                }
            })
        })
        .collect();

    for i in 0..50 {
        echo(&mut stream, format!("message {i}\n").as_bytes());
    }

    for requester in requesters {
        requester.join().expect("Thread panicked");
    }

    echo(&mut stream, b"last\n");
}

#[test]
fn test_write_request_for_recycled_connection_is_ignored() {
    let fixture = Fixture::new();

    let mut first = fixture.connect();
    echo(&mut first, b"one\n");
    let stale = fixture.connection();
    drop(first);

    thread::sleep(Duration::from_millis(100));

    let mut second = fixture.connect();
    echo(&mut second, b"two\n");
    assert_ne!(fixture.connection(), stale);

    fixture
        .worker
        .handle()
        .want_to_write(stale)
        .expect("Failed to request write");

    echo(&mut second, b"three\n");
}
