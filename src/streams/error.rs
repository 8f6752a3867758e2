use std::{error::Error, fmt, sync::Arc};

pub type StreamResult<T> = Result<T, StreamError>;

/// Errors surfaced by streams, readers and pipes.
///
/// Failures raised by source hooks or strategy callbacks are fatal to the
/// stream: they force the `Errored` state and are re-raised to the immediate
/// caller. Terminal futures (`closed`, pending reads) report the same stored
/// error to every waiter, so the variants are cheaply cloneable.
#[derive(Debug, Clone)]
pub enum StreamError {
    /// A second reader was requested while one is attached.
    AlreadyLocked,
    /// `release_lock()` was called with unsettled read requests.
    PendingReads,
    /// A strategy produced a chunk size that is negative, NaN or infinite.
    InvalidSize(f64),
    /// `dequeue()` on an empty queue.
    QueueEmpty,
    /// Enqueue on a closed stream.
    Closed,
    /// Enqueue after close was requested but before the queue drained.
    Draining,
    /// The driver future was dropped before the operation could complete.
    TaskDropped,
    /// Any error propagated verbatim from a source or strategy.
    Other(Arc<dyn Error + Send + Sync>),
}

impl StreamError {
    /// Wrap any error type into `StreamError`
    pub fn other<E>(e: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        StreamError::Other(Arc::new(e))
    }

    /// Wrap a boxed error
    pub fn other_boxed(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        #[derive(Debug)]
        struct SimpleError(String);
        impl fmt::Display for SimpleError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl Error for SimpleError {}
        StreamError::Other(Arc::new(SimpleError(s.to_string())))
    }
}

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::from(s.as_str())
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::Other(Arc::new(e))
    }
}

impl From<Box<dyn Error + Send + Sync>> for StreamError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::AlreadyLocked => {
                write!(f, "Stream is already locked for exclusive reading")
            }
            StreamError::PendingReads => {
                write!(f, "Cannot release a reader with unsettled read requests")
            }
            StreamError::InvalidSize(size) => {
                write!(f, "Chunk size must be a non-negative finite number, got {size}")
            }
            StreamError::QueueEmpty => write!(f, "Queue is empty"),
            StreamError::Closed => write!(f, "Stream is closed"),
            StreamError::Draining => write!(f, "Stream is draining"),
            StreamError::TaskDropped => write!(f, "Stream driver task was dropped"),
            StreamError::Other(err) => write!(f, "{err}"),
        }
    }
}

impl Error for StreamError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StreamError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
