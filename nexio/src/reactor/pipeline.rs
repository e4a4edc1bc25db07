//! Message processing over a connection's buffered input.
//!
//! Every attempt records a checkpoint (input position and limit, output
//! size) so an incomplete or rejected message leaves no trace in either
//! buffer.

use crate::connection::Connection;
use crate::protocol::{Outcome, Protocol};

use tracing::{error, trace, warn};

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

const PROTOCOL_ERROR: &str = "Protocol error!";

/// Runs the protocol once.
///
/// Returns `true` if a whole message was consumed.
pub(crate) fn process_next<P: Protocol + ?Sized>(protocol: &P, conn: &mut Connection) -> bool {
    conn.begin_attempt();

    let position = conn.input.position();
    let limit = conn.input.limit();
    let output_size = conn.output.size();

    let result = panic::catch_unwind(AssertUnwindSafe(|| protocol.process(conn)));

    match result {
        Ok(Ok(Outcome::Complete)) => {
            if !conn.is_closed() && !conn.is_async() {
                conn.done = true;
            }
            true
        }

        Ok(Ok(Outcome::Incomplete)) => {
            trace!(conn = ?conn.handle(), "incomplete message, rolling back");

            conn.input.rewind(position, limit);
            conn.output.delete_after(output_size);
            false
        }

        Ok(Ok(Outcome::ProtocolError(reason))) => {
            let reason = reason.as_deref().unwrap_or(PROTOCOL_ERROR);
            warn!(peer = ?conn.peer_addr(), reason, "protocol error");

            conn.output.delete_after(output_size);
            conn.write(reason.as_bytes());
            conn.close_after_write();
            false
        }

        Ok(Err(e)) => {
            error!(peer = ?conn.peer_addr(), error = %e, "failed to process message");

            conn.close();
            false
        }

        Err(payload) => {
            error!(
                peer = ?conn.peer_addr(),
                panic = panic_message(payload.as_ref()),
                "protocol panicked"
            );

            conn.close();
            false
        }
    }
}

/// Processes buffered messages until one does not complete, the
/// connection stops accepting work, or `max` messages were handled.
pub(crate) fn process_msgs<P: Protocol + ?Sized>(
    protocol: &P,
    conn: &mut Connection,
    max: usize,
) -> usize {
    let mut count = 0;

    while count < max && accepts_more(conn) {
        let position = conn.input.position();
        if !process_next(protocol, conn) {
            break;
        }
        count += 1;

        if conn.input.position() <= position {
            trace!(conn = ?conn.handle(), "completed message consumed no input");
            break;
        }
    }

    count
}

/// Processes the input received by one read event.
pub(crate) fn process<P: Protocol + ?Sized>(
    protocol: &P,
    conn: &mut Connection,
    max: usize,
) -> usize {
    let count = process_msgs(protocol, conn, max);
    conn.completed_input_pos = conn.input.position();

    count
}

/// Runs one attempt regardless of buffered input.
///
/// Used right after a connection is established.
pub(crate) fn attempt<P: Protocol + ?Sized>(protocol: &P, conn: &mut Connection) -> bool {
    let complete = process_next(protocol, conn);
    conn.completed_input_pos = conn.input.position();

    complete
}

/// Processes a resumed asynchronous connection: one unconditional attempt,
/// then any input that was buffered in the meantime. A connection already
/// closing after its last write is left alone.
pub(crate) fn resume<P: Protocol + ?Sized>(
    protocol: &P,
    conn: &mut Connection,
    max: usize,
) -> usize {
    if conn.closes_after_write() {
        trace!(conn = ?conn.handle(), "resume of a closing connection ignored");
        return 0;
    }

    let mut count = 0;

    if process_next(protocol, conn) {
        count = 1 + process_msgs(protocol, conn, max.saturating_sub(1));
    }
    conn.completed_input_pos = conn.input.position();

    count
}

fn accepts_more(conn: &Connection) -> bool {
    conn.input.has_remaining()
        && !conn.is_closed()
        && !conn.is_async()
        && !conn.closes_after_write()
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoxError;
    use crate::connection::Role;
    use crate::reactor::handoff::test_handle;

    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn connection() -> Connection {
        let mut conn = Connection::new(0, test_handle());
        conn.reopen();
        conn.attach_socket(-1, 0, Role::Server, None);
        conn
    }

    /// Upper-cases newline-terminated lines, rejects lines starting with `!`.
    #[derive(Default)]
    struct Lines {
        calls: AtomicUsize,
    }

    impl Protocol for Lines {
        fn process(&self, conn: &mut Connection) -> Result<Outcome, BoxError> {
            self.calls.fetch_add(1, Ordering::Relaxed);

            conn.write(b"partial");

            let Some(end) = conn.input().find(b"\n") else {
                return Ok(Outcome::Incomplete);
            };

            let line = conn.input_mut().take(end + 1).unwrap().to_ascii_uppercase();
            let checkpoint = conn.output().size() - 7;
            conn.output_mut().delete_after(checkpoint);

            match line.first() {
                Some(b'!') => Ok(Outcome::protocol_error("bad line\n")),
                Some(b'?') => Err("unexpected".into()),
                Some(b'#') => panic!("boom"),
                _ => {
                    conn.write(&line);
                    Ok(Outcome::Complete)
                }
            }
        }
    }

    #[test]
    fn pipelines_concatenated_messages_in_order() {
        let protocol = Lines::default();
        let mut conn = connection();
        conn.input.append(b"a\nb\nc\n");

        let count = process(&protocol, &mut conn, usize::MAX);

        assert_eq!(count, 3);
        assert_eq!(conn.output().as_slice(), b"A\nB\nC\n");
        assert_eq!(conn.completed_input_pos(), 6);
        assert!(conn.is_done());
    }

    #[test]
    fn pipeline_limit_caps_messages_per_pass() {
        let protocol = Lines::default();
        let mut conn = connection();
        conn.input.append(b"a\nb\nc\n");

        assert_eq!(process(&protocol, &mut conn, 2), 2);
        assert_eq!(conn.output().as_slice(), b"A\nB\n");
        assert_eq!(conn.completed_input_pos(), 4);
    }

    #[test]
    fn complete_without_consuming_input_stops_pipelining() {
        let protocol = |conn: &mut Connection| -> Result<Outcome, BoxError> {
            conn.write(b"x");
            Ok(Outcome::Complete)
        };
        let mut conn = connection();
        conn.input.append(b"unread");

        assert_eq!(process(&protocol, &mut conn, usize::MAX), 1);
        assert_eq!(conn.output().as_slice(), b"x");
        assert_eq!(conn.completed_input_pos(), 0);
        assert_eq!(conn.input().remaining(), 6);
    }

    #[test]
    fn incomplete_message_rolls_back() {
        let protocol = Lines::default();
        let mut conn = connection();
        conn.input.append(b"a\nhel");

        assert_eq!(process(&protocol, &mut conn, usize::MAX), 1);
        assert_eq!(conn.output().as_slice(), b"A\n");
        assert_eq!(conn.input().position(), 2);
        assert_eq!(conn.input().limit(), 5);

        conn.input.append(b"lo\n");
        assert_eq!(process(&protocol, &mut conn, usize::MAX), 1);
        assert_eq!(conn.output().as_slice(), b"A\nHELLO\n");
    }

    #[test]
    fn protocol_error_replaces_partial_output() {
        let protocol = Lines::default();
        let mut conn = connection();
        conn.input.append(b"ok\n!no\nnever\n");

        assert_eq!(process(&protocol, &mut conn, usize::MAX), 1);

        assert_eq!(conn.output().as_slice(), b"OK\nbad line\n");
        assert!(conn.closes_after_write());
        assert!(!conn.is_closed());
        assert_eq!(protocol.calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn protocol_error_without_reason_uses_generic_message() {
        let protocol = |_: &mut Connection| -> Result<Outcome, BoxError> {
            Ok(Outcome::ProtocolError(None))
        };
        let mut conn = connection();
        conn.input.append(b"x");

        process(&protocol, &mut conn, usize::MAX);

        assert_eq!(conn.output().as_slice(), b"Protocol error!");
    }

    #[test]
    fn failure_closes_without_response() {
        let protocol = Lines::default();
        let mut conn = connection();
        conn.input.append(b"?\n");

        process(&protocol, &mut conn, usize::MAX);

        assert!(conn.is_closed());
        assert!(conn.close_requested());
    }

    #[test]
    fn panic_is_contained() {
        let protocol = Lines::default();
        let mut conn = connection();
        conn.input.append(b"#\nafter\n");

        assert_eq!(process(&protocol, &mut conn, usize::MAX), 0);
        assert!(conn.is_closed());
    }

    #[test]
    fn async_connection_stops_pipelining_until_resumed() {
        let protocol = |conn: &mut Connection| -> Result<Outcome, BoxError> {
            if conn.take_attachment::<()>().is_some() {
                conn.write(b"W");
                return Ok(Outcome::Complete);
            }

            match conn.input_mut().get_u8() {
                Some(b'w') => {
                    conn.attach(());
                    conn.set_async();
                }
                Some(byte) => conn.write(&[byte]),
                None => return Ok(Outcome::Incomplete),
            }

            Ok(Outcome::Complete)
        };

        let mut conn = connection();
        conn.input.append(b"awbc");

        assert_eq!(process(&protocol, &mut conn, usize::MAX), 2);
        assert!(conn.is_async());
        assert!(!conn.is_done());
        assert_eq!(conn.output().as_slice(), b"a");
        assert_eq!(conn.completed_input_pos(), 2);

        assert_eq!(resume(&protocol, &mut conn, usize::MAX), 3);
        assert!(!conn.is_async());
        assert_eq!(conn.output().as_slice(), b"aWbc");
        assert_eq!(conn.completed_input_pos(), 4);
    }

    #[test]
    fn resume_leaves_connection_closing_after_protocol_error() {
        let protocol = Lines::default();
        let mut conn = connection();
        conn.input.append(b"!x\nlater\n");

        assert_eq!(process(&protocol, &mut conn, usize::MAX), 0);
        assert!(conn.closes_after_write());

        assert_eq!(resume(&protocol, &mut conn, usize::MAX), 0);
        assert_eq!(protocol.calls.load(Ordering::Relaxed), 1);
        assert_eq!(conn.output().as_slice(), b"bad line\n");
    }

    #[test]
    fn initial_attempt_runs_on_empty_input() {
        let protocol = |conn: &mut Connection| -> Result<Outcome, BoxError> {
            if conn.is_initial() {
                conn.write(b"hello\n");
            }
            Ok(Outcome::Complete)
        };
        let mut conn = connection();

        assert!(attempt(&protocol, &mut conn));
        assert_eq!(conn.output().as_slice(), b"hello\n");
    }

    proptest! {
        #[test]
        fn pipelining_answers_every_whole_line(
            lines in prop::collection::vec("[a-z]{1,12}", 1..20),
            tail in "[a-z]{0,8}",
        ) {
            let protocol = Lines::default();
            let mut conn = connection();

            let mut input = String::new();
            for line in &lines {
                input.push_str(line);
                input.push('\n');
            }
            let whole = input.len();
            input.push_str(&tail);

            conn.input.append(input.as_bytes());
            let count = process(&protocol, &mut conn, usize::MAX);

            let expected = input[..whole].to_ascii_uppercase();

            prop_assert_eq!(count, lines.len());
            prop_assert_eq!(conn.completed_input_pos(), whole);
            prop_assert_eq!(conn.output().as_slice(), expected.as_bytes());
        }

        #[test]
        fn split_message_responds_once(line in "[a-z]{2,32}", split in 1usize..32) {
            let protocol = Lines::default();
            let mut conn = connection();

            let message = format!("{line}\n");
            let split = split.min(message.len() - 1);

            conn.input.append(&message.as_bytes()[..split]);
            prop_assert_eq!(process(&protocol, &mut conn, usize::MAX), 0);
            prop_assert_eq!(conn.input().position(), 0);
            prop_assert!(conn.output().is_empty());

            let expected = message.to_ascii_uppercase();

            conn.input.append(&message.as_bytes()[split..]);
            prop_assert_eq!(process(&protocol, &mut conn, usize::MAX), 1);
            prop_assert_eq!(conn.output().as_slice(), expected.as_bytes());
        }
    }
}
