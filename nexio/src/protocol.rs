//! The processing contract between the worker and the application.

use crate::connection::Connection;
use crate::error::BoxError;

/// Result of one processing attempt over a connection's input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// One message was fully consumed; its response, if any, is in the
    /// output buffer.
    Complete,

    /// Not enough input yet. The worker restores the input cursor and
    /// drops whatever was appended to the output during the attempt.
    Incomplete,

    /// The peer violated the protocol. The worker replaces the partial
    /// output with this message (or a generic one) and closes the
    /// connection once it has been flushed.
    ProtocolError(Option<String>),
}

impl Outcome {
    /// Shorthand for a protocol error carrying a reason.
    pub fn protocol_error(reason: impl Into<String>) -> Self {
        Outcome::ProtocolError(Some(reason.into()))
    }
}

/// Application-supplied message processor.
///
/// The worker calls [`process`](Protocol::process) once per message with the
/// input cursor positioned at the start of unconsumed bytes. Returning
/// `Err` (or panicking) counts as an unexpected failure: the connection is
/// closed immediately and nothing is sent.
///
/// A protocol may also:
/// - call [`Connection::set_async`] and resume the connection later from
///   any thread through its [`AsyncHandle`](crate::AsyncHandle),
/// - store per-connection state with [`Connection::attach`],
/// - close the connection itself with [`Connection::close`] or
///   [`Connection::close_after_write`].
///
/// # Examples
///
/// A line echo protocol:
///
/// ```
/// use nexio::{BoxError, Connection, Outcome, Protocol};
///
/// struct Echo;
///
/// impl Protocol for Echo {
///     fn process(&self, conn: &mut Connection) -> Result<Outcome, BoxError> {
///         let Some(end) = conn.input().find(b"\n") else {
///             return Ok(Outcome::Incomplete);
///         };
///
///         let line = conn.input_mut().take(end + 1).unwrap().to_vec();
///         conn.write(&line);
///
///         Ok(Outcome::Complete)
///     }
/// }
/// ```
pub trait Protocol: Send + Sync + 'static {
    fn process(&self, conn: &mut Connection) -> Result<Outcome, BoxError>;
}

impl<F> Protocol for F
where
    F: Fn(&mut Connection) -> Result<Outcome, BoxError> + Send + Sync + 'static,
{
    fn process(&self, conn: &mut Connection) -> Result<Outcome, BoxError> {
        self(conn)
    }
}
