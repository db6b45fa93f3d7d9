//! Error types for proxying requests and maintaining backend connections.

use std::{error::Error as StdError, fmt, io};

/// A `Result` alias where the `Err` case is `backhaul::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type that can be used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The errors that may occur while proxying a request or maintaining a
/// backend connection.
///
/// Errors carry the backend destination they relate to where one exists, so
/// a log line or metric label can name the upstream without the caller
/// re-threading it.
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    destination: Option<String>,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
                destination: None,
            }),
        }
    }

    pub(crate) fn config<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Config, Some(e))
    }

    pub(crate) fn not_connected(dest: &str) -> Error {
        Error::new(Kind::NotConnected, None::<Error>).with_destination(dest)
    }

    pub(crate) fn persistent_eof<E: Into<BoxError>>(dest: &str, e: E) -> Error {
        Error::new(Kind::PersistentEof, Some(e)).with_destination(dest)
    }

    pub(crate) fn temporary<E: Into<BoxError>>(dest: &str, e: E) -> Error {
        Error::new(Kind::TemporaryNet, Some(e)).with_destination(dest)
    }

    pub(crate) fn permanent<E: Into<BoxError>>(dest: &str, e: E) -> Error {
        Error::new(Kind::PermanentNet, Some(e)).with_destination(dest)
    }

    pub(crate) fn body_copy<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::BodyCopy, Some(e))
    }

    pub(crate) fn request_body<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::RequestBody, Some(e))
    }

    pub(crate) fn no_pool() -> Error {
        Error::new(Kind::NoPool, None::<Error>)
    }

    pub(crate) fn no_backends() -> Error {
        Error::new(Kind::NoBackends, None::<Error>)
    }

    pub(crate) fn backends_exhausted() -> Error {
        Error::new(Kind::BackendsExhausted, None::<Error>)
    }

    fn with_destination(mut self, dest: &str) -> Error {
        self.inner.destination = Some(dest.to_owned());
        self
    }

    /// Classify an I/O error from a backend socket.
    ///
    /// Errors a peer may clear on its own (timeouts, interrupted syscalls)
    /// come back as temporary; the reconnect path treats those as a no-op
    /// because the connection is presumed still viable. Everything else is
    /// a permanent network error.
    pub(crate) fn from_io(dest: &str, e: io::Error) -> Error {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                Error::temporary(dest, e)
            }
            _ => Error::permanent(dest, e),
        }
    }

    /// Classify a hyper client error from a keep-alive dispatch.
    ///
    /// An upstream that closed the persistent connection (before or mid
    /// response) surfaces from the framing layer as a closed-channel or
    /// incomplete-message error; that is the persistent-EOF case and the
    /// slot must be reconnected. Other errors are classified by the I/O
    /// error at the bottom of the source chain when there is one.
    pub(crate) fn from_dispatch(dest: &str, e: hyper::Error) -> Error {
        if e.is_closed() || e.is_incomplete_message() || e.is_canceled() {
            return Error::persistent_eof(dest, e);
        }

        match find_io_kind(&e) {
            Some(io::ErrorKind::WouldBlock)
            | Some(io::ErrorKind::TimedOut)
            | Some(io::ErrorKind::Interrupted) => Error::temporary(dest, e),
            _ => Error::permanent(dest, e),
        }
    }
}

fn find_io_kind(e: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut source = e.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<io::Error>() {
            return Some(io.kind());
        }
        source = err.source();
    }
    None
}

impl Error {
    /// Returns the backend destination related to this error, if any.
    pub fn destination(&self) -> Option<&str> {
        self.inner.destination.as_deref()
    }

    /// Returns true if the error came from configuration loading.
    pub fn is_config(&self) -> bool {
        matches!(self.inner.kind, Kind::Config)
    }

    /// Returns true if the slot had no live client when dispatch was tried.
    pub fn is_not_connected(&self) -> bool {
        matches!(self.inner.kind, Kind::NotConnected)
    }

    /// Returns true if the upstream closed its keep-alive connection.
    pub fn is_persistent_eof(&self) -> bool {
        matches!(self.inner.kind, Kind::PersistentEof)
    }

    /// Returns true for network errors the connection may recover from
    /// without a reconnect.
    pub fn is_temporary(&self) -> bool {
        matches!(self.inner.kind, Kind::TemporaryNet)
    }

    /// Returns true for network errors that require tearing the
    /// connection down.
    pub fn is_permanent(&self) -> bool {
        matches!(self.inner.kind, Kind::PermanentNet)
    }

    /// Returns true if relaying a response body failed after the status
    /// and headers were already written.
    pub fn is_body_copy(&self) -> bool {
        matches!(self.inner.kind, Kind::BodyCopy)
    }

    /// Returns true if the inbound request body could not be read.
    pub fn is_request_body(&self) -> bool {
        matches!(self.inner.kind, Kind::RequestBody)
    }

    /// Returns true if no pool is registered for the request's host.
    pub fn is_no_pool(&self) -> bool {
        matches!(self.inner.kind, Kind::NoPool)
    }

    /// Returns true if the matched pool has no backends at all.
    pub fn is_no_backends(&self) -> bool {
        matches!(self.inner.kind, Kind::NoBackends)
    }

    /// Returns true if every failover cycle was exhausted without a
    /// successful dispatch.
    pub fn is_backends_exhausted(&self) -> bool {
        matches!(self.inner.kind, Kind::BackendsExhausted)
    }

    /// Whether the dispatcher should schedule a reconnect for the slot
    /// that produced this error.
    ///
    /// Temporary network errors leave the connection in place; everything
    /// else that names a backend tears it down and redials.
    pub fn wants_reconnect(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::NotConnected | Kind::PersistentEof | Kind::PermanentNet
        )
    }

    /// A short stable label for the error kind, used as a metric label.
    pub fn kind_label(&self) -> &'static str {
        match self.inner.kind {
            Kind::Config => "config",
            Kind::NotConnected => "not_connected",
            Kind::PersistentEof => "persistent_eof",
            Kind::TemporaryNet => "temporary_net",
            Kind::PermanentNet => "permanent_net",
            Kind::BodyCopy => "body_copy",
            Kind::RequestBody => "request_body",
            Kind::NoPool => "no_pool",
            Kind::NoBackends => "no_backends",
            Kind::BackendsExhausted => "backends_exhausted",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("backhaul::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref dest) = self.inner.destination {
            builder.field("destination", dest);
        }

        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::Config => f.write_str("configuration error")?,
            Kind::NotConnected => f.write_str("backend not connected")?,
            Kind::PersistentEof => f.write_str("backend closed persistent connection")?,
            Kind::TemporaryNet => f.write_str("temporary network error")?,
            Kind::PermanentNet => f.write_str("network error")?,
            Kind::BodyCopy => f.write_str("error copying response body")?,
            Kind::RequestBody => f.write_str("error reading request body")?,
            Kind::NoPool => f.write_str("host not configured")?,
            Kind::NoBackends => f.write_str("no backends configured")?,
            Kind::BackendsExhausted => f.write_str("all backends exhausted")?,
        };

        if let Some(dest) = &self.inner.destination {
            write!(f, " for backend ({dest})")?;
        }

        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[derive(Debug)]
pub(crate) enum Kind {
    Config,
    NotConnected,
    PersistentEof,
    TemporaryNet,
    PermanentNet,
    BodyCopy,
    RequestBody,
    NoPool,
    NoBackends,
    BackendsExhausted,
}

/// Error placed on dial attempts that exceed the backoff timeout.
#[derive(Debug)]
pub(crate) struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}
