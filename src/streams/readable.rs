//! The stream core: state machine, pull scheduling and the exclusive reader.
//!
//! A stream is a handle over shared state plus a driver future that owns the
//! source. Constructing a stream through the builder yields both; the caller
//! decides where the driver runs (`prepare()` hands the future back,
//! `spawn(spawn_fn)` hands it to any executor). The handles talk to the
//! driver over an unbounded command channel and settle individual requests
//! through oneshot completions.

use super::error::{StreamError, StreamResult};
use super::queue::SizedQueue;
use super::{cell::CompletionCell, DefaultQueuingStrategy, QueuingStrategy};
use crate::platform::{BoxedStrategy, MaybeSend, MaybeSync, PlatformBoxFutureStatic, SharedPtr};
use futures::{
    channel::{
        mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    future::{ready, Either},
    stream::StreamExt,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Readable,
    Closed,
    Errored,
}

// ----------- Source Trait -----------

/// The producer side of a stream.
///
/// Every hook is optional: the defaults settle immediately with `Ok(())`.
/// Hooks receive the [`StreamController`], the `(enqueue, close, error)`
/// signaling triple bound to the owning stream. A hook rejection is fatal:
/// the stream transitions to `Errored` with that reason.
pub trait Source<T: MaybeSend + 'static>: MaybeSend + 'static {
    /// Invoked once at driver startup. No pull happens until it settles.
    fn start(
        &mut self,
        _controller: &StreamController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        async { Ok(()) }
    }

    /// Invoked whenever the stream wants more data. At most one pull is in
    /// flight at a time.
    fn pull(
        &mut self,
        _controller: &StreamController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        async { Ok(()) }
    }

    /// Invoked when the consumer cancels the stream. The stream is already
    /// `Closed` by the time this runs; the hook's outcome settles the future
    /// returned by `cancel()`.
    fn cancel(
        &mut self,
        _reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        async { Ok(()) }
    }
}

// ----------- Driver Protocol -----------

enum DriverMsg {
    /// Run one pull against the source. Sent only while no pull is in flight.
    Pull,
    /// Run the source's cancel hook and settle the completion with its result.
    Cancel {
        reason: Option<String>,
        completion: oneshot::Sender<StreamResult<()>>,
    },
    /// The stream reached a terminal state with no cancel pending.
    Shutdown,
}

// ----------- Shared State -----------

struct ReaderMirror {
    state: StreamState,
    stored_error: Option<StreamError>,
}

/// Lock slot for the attached reader. The stream owns it; the reader handle
/// proves identity by pointer equality on `mirror`, never by a back-pointer.
struct ReaderSlot<T> {
    mirror: SharedPtr<Mutex<ReaderMirror>>,
    closed: SharedPtr<CompletionCell>,
    pending_reads: VecDeque<oneshot::Sender<StreamResult<Option<T>>>>,
}

struct Inner<T: MaybeSend + 'static> {
    state: StreamState,
    queue: SizedQueue<T>,
    strategy: BoxedStrategy<T>,
    stored_error: Option<StreamError>,
    draining: bool,
    started: bool,
    pulling: bool,
    pull_scheduled: bool,
    cancel_requested: bool,
    reader: Option<ReaderSlot<T>>,
    driver_tx: UnboundedSender<DriverMsg>,
}

struct Shared<T: MaybeSend + 'static> {
    inner: Mutex<Inner<T>>,
}

fn stream_error_of<T: MaybeSend + 'static>(inner: &Inner<T>) -> StreamError {
    inner
        .stored_error
        .clone()
        .unwrap_or_else(|| "Stream is errored".into())
}

fn mirror_error(mirror: &ReaderMirror) -> StreamError {
    mirror
        .stored_error
        .clone()
        .unwrap_or_else(|| "Stream is errored".into())
}

// ----------- Core Algorithms -----------
//
// These operate on a locked `Inner` and mirror the signaling functions the
// stream hands to its source. The mutex is never held across an await.

fn should_apply_backpressure<T: MaybeSend + 'static>(inner: &mut Inner<T>) -> StreamResult<bool> {
    let total = inner.queue.total_size();
    match inner.strategy.should_apply_backpressure(total) {
        Ok(backpressure) => Ok(backpressure),
        Err(e) => {
            error_stream(inner, e.clone());
            Err(e)
        }
    }
}

/// Pull scheduling: run a pull only when started, readable, not draining, no
/// pull scheduled, none in flight, and the strategy permits it. While a pull
/// is outstanding, exactly one follow-up is remembered no matter how many
/// triggering events arrive.
fn maybe_pull<T: MaybeSend + 'static>(inner: &mut Inner<T>) {
    if inner.draining
        || !inner.started
        || inner.state != StreamState::Readable
        || inner.pull_scheduled
    {
        return;
    }
    if inner.pulling {
        inner.pull_scheduled = true;
        return;
    }
    match should_apply_backpressure(inner) {
        Ok(false) => {}
        Ok(true) | Err(_) => return,
    }
    inner.pulling = true;
    let _ = inner.driver_tx.unbounded_send(DriverMsg::Pull);
}

fn enqueue_chunk<T: MaybeSend + 'static>(inner: &mut Inner<T>, chunk: T) -> StreamResult<bool> {
    match inner.state {
        StreamState::Errored => return Err(stream_error_of(inner)),
        StreamState::Closed => return Err(StreamError::Closed),
        StreamState::Readable => {}
    }
    if inner.draining {
        return Err(StreamError::Draining);
    }

    // a waiting read takes the chunk directly, bypassing the queue; a
    // request whose future was dropped hands the chunk back and is discarded
    let mut chunk = Some(chunk);
    while let Some(c) = chunk.take() {
        let tx = match inner
            .reader
            .as_mut()
            .and_then(|slot| slot.pending_reads.pop_front())
        {
            Some(tx) => tx,
            None => {
                chunk = Some(c);
                break;
            }
        };
        if let Err(Ok(Some(recovered))) = tx.send(Ok(Some(c))) {
            chunk = Some(recovered);
        }
    }

    if let Some(c) = chunk {
        let size = match inner.strategy.size(&c) {
            Ok(size) => size,
            Err(e) => {
                error_stream(inner, e.clone());
                return Err(e);
            }
        };
        if let Err(e) = inner.queue.enqueue(c, size) {
            error_stream(inner, e.clone());
            return Err(e);
        }
    }

    maybe_pull(inner);
    // Ok(true): more data is welcome; Ok(false): apply backpressure now
    should_apply_backpressure(inner).map(|backpressure| !backpressure)
}

fn close_requested<T: MaybeSend + 'static>(inner: &mut Inner<T>) {
    if inner.state != StreamState::Readable {
        return;
    }
    if inner.queue.is_empty() {
        close_stream(inner);
    } else {
        inner.draining = true;
    }
}

fn close_stream<T: MaybeSend + 'static>(inner: &mut Inner<T>) {
    inner.state = StreamState::Closed;
    inner.draining = false;
    release_reader(inner);
    if !inner.cancel_requested {
        let _ = inner.driver_tx.unbounded_send(DriverMsg::Shutdown);
    }
}

fn error_stream<T: MaybeSend + 'static>(inner: &mut Inner<T>, e: StreamError) {
    if inner.state != StreamState::Readable {
        return;
    }
    inner.queue.clear();
    inner.stored_error = Some(e);
    inner.state = StreamState::Errored;
    release_reader(inner);
    if !inner.cancel_requested {
        let _ = inner.driver_tx.unbounded_send(DriverMsg::Shutdown);
    }
}

/// Detach the reader, settling its `closed` cell and every pending read with
/// the stream's decided outcome. An explicit release on a still-readable
/// stream mirrors the reader as closed.
fn release_reader<T: MaybeSend + 'static>(inner: &mut Inner<T>) {
    let Some(mut slot) = inner.reader.take() else {
        return;
    };
    match inner.state {
        StreamState::Errored => {
            let e = stream_error_of(inner);
            {
                let mut mirror = slot.mirror.lock();
                mirror.state = StreamState::Errored;
                mirror.stored_error = Some(e.clone());
            }
            slot.closed.settle(Err(e.clone()));
            for tx in slot.pending_reads.drain(..) {
                let _ = tx.send(Err(e.clone()));
            }
        }
        _ => {
            slot.mirror.lock().state = StreamState::Closed;
            slot.closed.settle(Ok(()));
            for tx in slot.pending_reads.drain(..) {
                let _ = tx.send(Ok(None));
            }
        }
    }
}

/// Shared cancel algorithm. The terminal transition happens synchronously,
/// before the returned future is first polled; only the settlement of that
/// future waits for the source's cancel hook.
///
/// `holder` is the mirror of the reader making the call, or `None` for a
/// stream-level cancel, which must find the stream unlocked. Either check
/// runs under the same lock as the transition, so a reader attached or
/// released concurrently cannot slip between them.
fn cancel_stream<T: MaybeSend + 'static>(
    shared: &Shared<T>,
    holder: Option<&SharedPtr<Mutex<ReaderMirror>>>,
    reason: Option<String>,
) -> impl Future<Output = StreamResult<()>> + MaybeSend {
    let rx = {
        let mut inner = shared.inner.lock();
        match holder {
            None => {
                if inner.reader.is_some() {
                    return Either::Left(ready(Err(StreamError::AlreadyLocked)));
                }
            }
            Some(mirror) => {
                let attached = matches!(
                    &inner.reader,
                    Some(slot) if SharedPtr::ptr_eq(&slot.mirror, mirror)
                );
                if !attached {
                    // released in the meantime; the mirror holds the outcome
                    let mirror = mirror.lock();
                    return match mirror.state {
                        StreamState::Errored => {
                            Either::Left(ready(Err(mirror_error(&mirror))))
                        }
                        _ => Either::Left(ready(Ok(()))),
                    };
                }
            }
        }
        match inner.state {
            StreamState::Closed => return Either::Left(ready(Ok(()))),
            StreamState::Errored => return Either::Left(ready(Err(stream_error_of(&inner)))),
            StreamState::Readable => {}
        }
        inner.cancel_requested = true;
        inner.queue.clear();
        close_stream(&mut inner);
        let (tx, rx) = oneshot::channel();
        let msg = DriverMsg::Cancel {
            reason,
            completion: tx,
        };
        if inner.driver_tx.unbounded_send(msg).is_err() {
            return Either::Left(ready(Err(StreamError::TaskDropped)));
        }
        rx
    };
    Either::Right(async move { rx.await.unwrap_or(Err(StreamError::TaskDropped)) })
}

// ----------- Controller -----------

/// The `(enqueue, close, error)` signaling triple bound to one stream,
/// handed to every source hook. Cloneable so push-style sources can signal
/// from wherever their data arrives.
pub struct StreamController<T: MaybeSend + 'static> {
    shared: SharedPtr<Shared<T>>,
}

impl<T: MaybeSend + 'static> Clone for StreamController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: SharedPtr::clone(&self.shared),
        }
    }
}

impl<T: MaybeSend + 'static> StreamController<T> {
    /// Hand a chunk to the stream.
    ///
    /// Returns `Ok(true)` while more data is welcome and `Ok(false)` once
    /// backpressure should be applied. Fails when the stream is closed,
    /// draining or errored; strategy failures error the stream and are
    /// re-raised here.
    pub fn enqueue(&self, chunk: T) -> StreamResult<bool> {
        enqueue_chunk(&mut self.shared.inner.lock(), chunk)
    }

    /// Signal that no more chunks will be produced. Queued chunks are still
    /// delivered; the stream closes once the queue drains. No-op unless
    /// readable.
    pub fn close(&self) {
        close_requested(&mut self.shared.inner.lock());
    }

    /// Move the stream to `Errored` with `error`, dropping all queued chunks
    /// and rejecting the attached reader. No-op unless readable.
    pub fn error(&self, error: StreamError) {
        error_stream(&mut self.shared.inner.lock(), error);
    }

    pub fn state(&self) -> StreamState {
        self.shared.inner.lock().state
    }
}

// ----------- Driver -----------

async fn drive<T, S>(
    shared: SharedPtr<Shared<T>>,
    mut source: S,
    mut driver_rx: UnboundedReceiver<DriverMsg>,
) where
    T: MaybeSend + 'static,
    S: Source<T>,
{
    let controller = StreamController {
        shared: SharedPtr::clone(&shared),
    };

    let started = source.start(&controller).await;
    {
        let mut inner = shared.inner.lock();
        match started {
            Ok(()) => {
                inner.started = true;
                maybe_pull(&mut inner);
            }
            Err(e) => error_stream(&mut inner, e),
        }
        if inner.state != StreamState::Readable && !inner.cancel_requested {
            return;
        }
    }

    while let Some(msg) = driver_rx.next().await {
        match msg {
            DriverMsg::Pull => {
                let run = {
                    let mut inner = shared.inner.lock();
                    if inner.state == StreamState::Readable {
                        true
                    } else {
                        // stale signal from before a terminal transition
                        inner.pulling = false;
                        false
                    }
                };
                if run {
                    let result = source.pull(&controller).await;
                    let mut inner = shared.inner.lock();
                    inner.pulling = false;
                    match result {
                        Ok(()) => {
                            if inner.pull_scheduled {
                                inner.pull_scheduled = false;
                                maybe_pull(&mut inner);
                            }
                        }
                        Err(e) => error_stream(&mut inner, e),
                    }
                }
            }
            DriverMsg::Cancel { reason, completion } => {
                let result = source.cancel(reason).await;
                let _ = completion.send(result.map(|_| ()));
                break;
            }
            DriverMsg::Shutdown => {}
        }

        let inner = shared.inner.lock();
        if inner.state != StreamState::Readable && !inner.cancel_requested {
            break;
        }
    }
}

// ----------- ReadableStream -----------

/// Handle to a single-producer/single-consumer chunk stream.
pub struct ReadableStream<T: MaybeSend + 'static> {
    shared: SharedPtr<Shared<T>>,
}

impl<T: MaybeSend + 'static> ReadableStream<T> {
    /// Builder over a custom [`Source`].
    pub fn builder<S: Source<T>>(source: S) -> ReadableStreamBuilder<T, S> {
        ReadableStreamBuilder::new(source)
    }

    /// Stream that yields the elements of a vector, then closes.
    pub fn from_vec(items: Vec<T>) -> ReadableStreamBuilder<T, IteratorSource<std::vec::IntoIter<T>>>
    where
        std::vec::IntoIter<T>: MaybeSend,
    {
        ReadableStreamBuilder::new(IteratorSource::new(items.into_iter()))
    }

    /// Stream that yields the elements of an iterator, then closes.
    pub fn from_iter<I>(iter: I) -> ReadableStreamBuilder<T, IteratorSource<I::IntoIter>>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: MaybeSend + 'static,
    {
        ReadableStreamBuilder::new(IteratorSource::new(iter.into_iter()))
    }

    pub fn state(&self) -> StreamState {
        self.shared.inner.lock().state
    }

    pub fn locked(&self) -> bool {
        self.shared.inner.lock().reader.is_some()
    }

    /// Acquire the exclusive reader.
    ///
    /// Fails with [`StreamError::AlreadyLocked`] while another reader is
    /// attached. A reader acquired from an already-terminal stream is born
    /// released with its `closed` future pre-settled.
    pub fn get_reader(&self) -> StreamResult<StreamReader<T>> {
        let mut inner = self.shared.inner.lock();
        if inner.reader.is_some() {
            return Err(StreamError::AlreadyLocked);
        }

        let (mirror_state, closed_cell, attach) = match inner.state {
            StreamState::Readable => (
                ReaderMirror {
                    state: StreamState::Readable,
                    stored_error: None,
                },
                CompletionCell::new(),
                true,
            ),
            StreamState::Closed => (
                ReaderMirror {
                    state: StreamState::Closed,
                    stored_error: None,
                },
                CompletionCell::settled(Ok(())),
                false,
            ),
            StreamState::Errored => {
                let e = stream_error_of(&inner);
                (
                    ReaderMirror {
                        state: StreamState::Errored,
                        stored_error: Some(e.clone()),
                    },
                    CompletionCell::settled(Err(e)),
                    false,
                )
            }
        };

        let mirror = SharedPtr::new(Mutex::new(mirror_state));
        let closed = SharedPtr::new(closed_cell);
        if attach {
            inner.reader = Some(ReaderSlot {
                mirror: SharedPtr::clone(&mirror),
                closed: SharedPtr::clone(&closed),
                pending_reads: VecDeque::new(),
            });
        }

        Ok(StreamReader {
            shared: SharedPtr::clone(&self.shared),
            mirror,
            closed,
        })
    }

    /// Cancel the stream.
    ///
    /// Fails on a locked stream (cancel through the reader instead). The
    /// state flips to `Closed` synchronously, at call time; the returned
    /// future settles once the source's cancel hook settles, with the hook's
    /// success value discarded and its rejection propagated. On an already
    /// terminal stream the decided outcome is returned without invoking the
    /// hook again.
    pub fn cancel(
        &self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        cancel_stream(&self.shared, None, reason)
    }
}

// ----------- Builder -----------

pub struct ReadableStreamBuilder<T: MaybeSend + 'static, S> {
    source: S,
    strategy: BoxedStrategy<T>,
}

impl<T: MaybeSend + 'static, S: Source<T>> ReadableStreamBuilder<T, S> {
    fn new(source: S) -> Self {
        Self {
            source,
            strategy: Box::new(DefaultQueuingStrategy),
        }
    }

    /// Replace the default single-slot strategy.
    pub fn strategy<Q>(mut self, strategy: Q) -> Self
    where
        Q: QueuingStrategy<T> + MaybeSend + MaybeSync + 'static,
    {
        self.strategy = Box::new(strategy);
        self
    }

    /// Return stream + driver future without spawning.
    pub fn prepare(self) -> (ReadableStream<T>, impl Future<Output = ()> + MaybeSend) {
        let (driver_tx, driver_rx) = unbounded();
        let shared = SharedPtr::new(Shared {
            inner: Mutex::new(Inner {
                state: StreamState::Readable,
                queue: SizedQueue::new(),
                strategy: self.strategy,
                stored_error: None,
                draining: false,
                started: false,
                pulling: false,
                pull_scheduled: false,
                cancel_requested: false,
                reader: None,
                driver_tx,
            }),
        });
        let fut = drive(SharedPtr::clone(&shared), self.source, driver_rx);
        (ReadableStream { shared }, fut)
    }

    /// Spawn the driver with the given spawner and return the stream.
    pub fn spawn<F, R>(self, spawn_fn: F) -> ReadableStream<T>
    where
        F: FnOnce(PlatformBoxFutureStatic<()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}

// ----------- Example Source Implementations -----------

pub struct IteratorSource<I> {
    iter: I,
}

impl<I> IteratorSource<I> {
    pub fn new(iter: I) -> Self {
        Self { iter }
    }
}

impl<I, T> Source<T> for IteratorSource<I>
where
    I: Iterator<Item = T> + MaybeSend + 'static,
    T: MaybeSend + 'static,
{
    async fn pull(&mut self, controller: &StreamController<T>) -> StreamResult<()> {
        match self.iter.next() {
            Some(item) => {
                controller.enqueue(item)?;
            }
            None => controller.close(),
        }
        Ok(())
    }
}

// ----------- Exclusive Reader -----------

/// Exclusive-access token over one stream.
///
/// While attached, this is the only handle allowed to read from or cancel
/// the stream. The reader mirrors the stream's terminal state exactly once:
/// after the stream closes, errors, or the lock is released, the mirrored
/// state answers without touching the stream.
pub struct StreamReader<T: MaybeSend + 'static> {
    shared: SharedPtr<Shared<T>>,
    mirror: SharedPtr<Mutex<ReaderMirror>>,
    closed: SharedPtr<CompletionCell>,
}

impl<T: MaybeSend + 'static> StreamReader<T> {
    /// Read the next chunk; `Ok(None)` is the end-of-stream sentinel.
    ///
    /// With an empty queue the request parks FIFO on the reader and settles
    /// when the source enqueues, closes or errors.
    pub async fn read(&self) -> StreamResult<Option<T>> {
        let rx = {
            {
                let mirror = self.mirror.lock();
                match mirror.state {
                    StreamState::Closed => return Ok(None),
                    StreamState::Errored => return Err(mirror_error(&mirror)),
                    StreamState::Readable => {}
                }
            }

            let mut inner = self.shared.inner.lock();
            let attached = matches!(
                &inner.reader,
                Some(slot) if SharedPtr::ptr_eq(&slot.mirror, &self.mirror)
            );
            if !attached {
                // released between the two locks; the mirror holds the outcome
                let mirror = self.mirror.lock();
                return match mirror.state {
                    StreamState::Errored => Err(mirror_error(&mirror)),
                    _ => Ok(None),
                };
            }

            if !inner.queue.is_empty() {
                let chunk = inner.queue.dequeue()?;
                if inner.draining && inner.queue.is_empty() {
                    close_stream(&mut inner);
                } else {
                    maybe_pull(&mut inner);
                }
                return Ok(Some(chunk));
            }

            let (tx, rx) = oneshot::channel();
            if let Some(slot) = inner.reader.as_mut() {
                slot.pending_reads.push_back(tx);
            }
            rx
        };
        rx.await.unwrap_or(Err(StreamError::TaskDropped))
    }

    /// Terminal future: fulfills when the stream closes (or this reader is
    /// released), rejects with the stored error when it errors. Settles at
    /// most once and stays observable afterwards.
    pub async fn closed(&self) -> StreamResult<()> {
        self.closed.wait().await
    }

    /// Cancel the owning stream. On a released reader this returns the
    /// mirrored decided outcome without touching the stream.
    pub fn cancel(
        &self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        {
            let mirror = self.mirror.lock();
            match mirror.state {
                StreamState::Closed => return Either::Left(ready(Ok(()))),
                StreamState::Errored => return Either::Left(ready(Err(mirror_error(&mirror)))),
                StreamState::Readable => {}
            }
        }
        Either::Right(cancel_stream(&self.shared, Some(&self.mirror), reason))
    }

    /// Detach this reader without altering stream state; the stream stays
    /// readable and can be reacquired. Fails with
    /// [`StreamError::PendingReads`] while read requests are outstanding
    /// (requests whose futures were dropped no longer count). Releasing an
    /// already-released reader is a no-op.
    pub fn release_lock(&self) -> StreamResult<()> {
        let mut inner = self.shared.inner.lock();
        let attached = matches!(
            &inner.reader,
            Some(slot) if SharedPtr::ptr_eq(&slot.mirror, &self.mirror)
        );
        if !attached {
            return Ok(());
        }
        if let Some(slot) = inner.reader.as_mut() {
            slot.pending_reads.retain(|tx| !tx.is_canceled());
            if !slot.pending_reads.is_empty() {
                return Err(StreamError::PendingReads);
            }
        }
        release_reader(&mut inner);
        Ok(())
    }

    /// Adapt this reader into a `futures::Stream`. Ends after the sentinel;
    /// yields a single `Err` and then ends if the stream errors.
    pub fn into_stream(self) -> impl futures::Stream<Item = StreamResult<T>> {
        futures::stream::unfold((self, false), |(reader, done)| async move {
            if done {
                return None;
            }
            match reader.read().await {
                Ok(Some(chunk)) => Some((Ok(chunk), (reader, false))),
                Ok(None) => None,
                Err(e) => Some((Err(e), (reader, true))),
            }
        })
    }
}

impl<T: MaybeSend + 'static> Drop for StreamReader<T> {
    fn drop(&mut self) {
        // read futures borrow the reader, so none can be alive here
        let mut inner = self.shared.inner.lock();
        let attached = matches!(
            &inner.reader,
            Some(slot) if SharedPtr::ptr_eq(&slot.mirror, &self.mirror)
        );
        if attached {
            release_reader(&mut inner);
        }
    }
}
