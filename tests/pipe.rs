use chunkflow::{
    CompletionCell, CountQueuingStrategy, Destination, DestinationState, PipeOptions,
    ReadableStream, Source, StreamController, StreamError, StreamResult, StreamState,
    TransformPair,
};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

/// In-memory destination that records everything the pipe does to it.
struct MockDest {
    state: Mutex<DestinationState>,
    written: Mutex<Vec<u32>>,
    aborted: Mutex<Option<String>>,
    close_calls: AtomicUsize,
    closed_cell: CompletionCell,
}

impl MockDest {
    fn new() -> Self {
        Self {
            state: Mutex::new(DestinationState::Writable),
            written: Mutex::new(Vec::new()),
            aborted: Mutex::new(None),
            close_calls: AtomicUsize::new(0),
            closed_cell: CompletionCell::new(),
        }
    }

    /// A destination that has already finished closing.
    fn already_closed() -> Self {
        Self {
            state: Mutex::new(DestinationState::Closed),
            closed_cell: CompletionCell::settled(Ok(())),
            ..Self::new()
        }
    }
}

impl Destination<u32> for MockDest {
    fn state(&self) -> DestinationState {
        *self.state.lock()
    }

    async fn ready(&self) -> StreamResult<()> {
        Ok(())
    }

    async fn closed(&self) -> StreamResult<()> {
        self.closed_cell.wait().await
    }

    fn write(&self, chunk: u32) -> StreamResult<()> {
        self.written.lock().push(chunk);
        Ok(())
    }

    async fn close(&self) -> StreamResult<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = DestinationState::Closed;
        self.closed_cell.settle(Ok(()));
        Ok(())
    }

    fn abort(&self, reason: Option<String>) {
        *self.state.lock() = DestinationState::Errored;
        *self.aborted.lock() = reason;
        self.closed_cell.settle(Err("destination aborted".into()));
    }
}

struct NeverSource;
impl Source<u32> for NeverSource {}

struct FailingPull;
impl Source<u32> for FailingPull {
    async fn pull(&mut self, _controller: &StreamController<u32>) -> StreamResult<()> {
        Err("boom".into())
    }
}

struct CancelProbe {
    reason: Arc<Mutex<Option<String>>>,
    cancels: Arc<AtomicUsize>,
}
impl Source<u32> for CancelProbe {
    async fn cancel(&mut self, reason: Option<String>) -> StreamResult<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        *self.reason.lock() = reason;
        Ok(())
    }
}

#[tokio::test]
async fn pipes_every_chunk_then_closes_the_destination() {
    let stream = ReadableStream::from_vec(vec![1u32, 2, 3]).spawn(tokio::spawn);
    let dest = MockDest::new();

    stream.pipe_to(&dest, PipeOptions::default()).await.unwrap();

    assert_eq!(*dest.written.lock(), vec![1, 2, 3]);
    assert_eq!(dest.close_calls.load(Ordering::SeqCst), 1);
    assert_eq!(dest.state(), DestinationState::Closed);
    // the pipe released its lock on the way out
    assert!(!stream.locked());
    assert_eq!(stream.state(), StreamState::Closed);
}

#[tokio::test]
async fn prevent_close_leaves_the_destination_open() {
    let stream = ReadableStream::from_vec(vec![1u32, 2]).spawn(tokio::spawn);
    let dest = MockDest::new();

    let options = PipeOptions {
        prevent_close: true,
        ..PipeOptions::default()
    };
    stream.pipe_to(&dest, options).await.unwrap();

    assert_eq!(*dest.written.lock(), vec![1, 2]);
    assert_eq!(dest.close_calls.load(Ordering::SeqCst), 0);
    assert_eq!(dest.state(), DestinationState::Writable);
}

#[tokio::test]
async fn source_error_aborts_the_destination() {
    let stream = ReadableStream::builder(FailingPull).spawn(tokio::spawn);
    let dest = MockDest::new();

    let err = stream
        .pipe_to(&dest, PipeOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "boom");
    assert_eq!(dest.state(), DestinationState::Errored);
    assert_eq!(dest.aborted.lock().as_deref(), Some("boom"));
}

#[tokio::test]
async fn prevent_abort_spares_the_destination() {
    let stream = ReadableStream::builder(FailingPull).spawn(tokio::spawn);
    let dest = MockDest::new();

    let options = PipeOptions {
        prevent_abort: true,
        ..PipeOptions::default()
    };
    let err = stream.pipe_to(&dest, options).await.unwrap_err();
    assert_eq!(err.to_string(), "boom");
    assert_eq!(dest.state(), DestinationState::Writable);
    assert!(dest.aborted.lock().is_none());
}

#[tokio::test]
async fn destination_going_away_cancels_the_source() {
    let reason = Arc::new(Mutex::new(None));
    let cancels = Arc::new(AtomicUsize::new(0));
    let stream = ReadableStream::builder(CancelProbe {
        reason: Arc::clone(&reason),
        cancels: Arc::clone(&cancels),
    })
    .spawn(tokio::spawn);
    let dest = MockDest::already_closed();

    let err = stream
        .pipe_to(&dest, PipeOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot be piped"));
    assert_eq!(cancels.load(Ordering::SeqCst), 1);
    assert!(reason.lock().as_deref().unwrap().contains("cannot be piped"));
    assert_eq!(stream.state(), StreamState::Closed);
}

#[tokio::test]
async fn prevent_cancel_releases_the_lock_instead() {
    let cancels = Arc::new(AtomicUsize::new(0));
    let stream = ReadableStream::builder(CancelProbe {
        reason: Arc::new(Mutex::new(None)),
        cancels: Arc::clone(&cancels),
    })
    .spawn(tokio::spawn);
    let dest = MockDest::already_closed();

    let options = PipeOptions {
        prevent_cancel: true,
        ..PipeOptions::default()
    };
    let err = stream.pipe_to(&dest, options).await.unwrap_err();
    assert!(err.to_string().contains("cannot be piped"));

    // the source is untouched and unlocked
    assert_eq!(cancels.load(Ordering::SeqCst), 0);
    assert_eq!(stream.state(), StreamState::Readable);
    assert!(!stream.locked());
}

#[tokio::test]
async fn locked_stream_refuses_to_pipe() {
    let stream = ReadableStream::builder(NeverSource).spawn(tokio::spawn);
    let _reader = stream.get_reader().unwrap();
    let dest = MockDest::new();

    assert!(matches!(
        stream.pipe_to(&dest, PipeOptions::default()).await,
        Err(StreamError::AlreadyLocked)
    ));
}

// ----------- pipe_through -----------

/// Source whose only job is to hand its controller out so a destination can
/// push into the stream from the outside.
struct Relay {
    slot: Arc<Mutex<Option<StreamController<u32>>>>,
}
impl Source<u32> for Relay {
    async fn start(&mut self, controller: &StreamController<u32>) -> StreamResult<()> {
        *self.slot.lock() = Some(controller.clone());
        Ok(())
    }
}

/// Writable end of a transform: forwards each chunk, doubled, into the
/// relayed stream.
struct DoublingDest {
    slot: Arc<Mutex<Option<StreamController<u32>>>>,
    closed_cell: CompletionCell,
}

impl Destination<u32> for DoublingDest {
    fn state(&self) -> DestinationState {
        if self.closed_cell.is_settled() {
            DestinationState::Closed
        } else {
            DestinationState::Writable
        }
    }

    async fn ready(&self) -> StreamResult<()> {
        Ok(())
    }

    async fn closed(&self) -> StreamResult<()> {
        self.closed_cell.wait().await
    }

    fn write(&self, chunk: u32) -> StreamResult<()> {
        let slot = self.slot.lock();
        let controller = slot
            .as_ref()
            .ok_or_else(|| StreamError::from("transform not started"))?;
        controller.enqueue(chunk * 2)?;
        Ok(())
    }

    async fn close(&self) -> StreamResult<()> {
        if let Some(controller) = self.slot.lock().as_ref() {
            controller.close();
        }
        self.closed_cell.settle(Ok(()));
        Ok(())
    }

    fn abort(&self, reason: Option<String>) {
        if let Some(controller) = self.slot.lock().as_ref() {
            controller.error(
                reason
                    .map(StreamError::from)
                    .unwrap_or(StreamError::Closed),
            );
        }
        self.closed_cell.settle(Err("destination aborted".into()));
    }
}

#[tokio::test]
async fn pipe_through_yields_the_transformed_stream() {
    let slot = Arc::new(Mutex::new(None));
    let inner = ReadableStream::builder(Relay {
        slot: Arc::clone(&slot),
    })
    .strategy(CountQueuingStrategy::new(16.0))
    .spawn(tokio::spawn);
    // let the relay capture its controller before the pipe starts writing
    tokio::time::sleep(Duration::from_millis(10)).await;

    let source = ReadableStream::from_vec(vec![1u32, 2, 3]).spawn(tokio::spawn);
    let (transformed, pipe) = source.pipe_through(
        TransformPair {
            writable: DoublingDest {
                slot,
                closed_cell: CompletionCell::new(),
            },
            readable: inner,
        },
        PipeOptions::default(),
    );
    let pipe = tokio::spawn(pipe);

    let reader = transformed.get_reader().unwrap();
    assert_eq!(reader.read().await.unwrap(), Some(2));
    assert_eq!(reader.read().await.unwrap(), Some(4));
    assert_eq!(reader.read().await.unwrap(), Some(6));
    assert_eq!(reader.read().await.unwrap(), None);
    pipe.await.unwrap().unwrap();
}
