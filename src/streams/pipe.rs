//! Piping a stream into a destination.
//!
//! The pipe owns the stream's reader for its whole lifetime and races three
//! concerns: the copy loop, the source's terminal future and the
//! destination's terminal future. Whichever settles first decides the
//! outcome; the losing futures are dropped before any teardown runs, so a
//! close initiated by the pipe itself can never be mistaken for the
//! destination going away on its own.

use super::error::{StreamError, StreamResult};
use super::readable::{ReadableStream, StreamReader};
use crate::platform::{MaybeSend, MaybeSync};
use futures::{
    future::{self, select, Either},
    join,
};
use std::future::Future;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationState {
    /// Accepting writes immediately.
    Writable,
    /// Alive but applying backpressure; `ready()` resolves when writable.
    Waiting,
    Closed,
    Errored,
}

/// The consumer-side contract a pipe writes into.
///
/// Implementations use interior mutability; the pipe only ever holds a
/// shared reference.
pub trait Destination<T: MaybeSend + 'static>: MaybeSend + MaybeSync {
    fn state(&self) -> DestinationState;

    /// Resolves once the destination can accept a write without queueing.
    fn ready(&self) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Terminal future: fulfills when the destination finishes closing,
    /// rejects when it errors.
    fn closed(&self) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Accept one chunk. Only called while `state()` is `Writable`.
    fn write(&self, chunk: T) -> StreamResult<()>;

    /// Flush and close; the future settles with the close outcome.
    fn close(&self) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Discard buffered data and tear down. Fire-and-forget.
    fn abort(&self, reason: Option<String>);
}

/// What the pipe does at each boundary event. All flags default to off,
/// meaning terminal conditions propagate in both directions.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipeOptions {
    /// Leave the destination open after the source closes cleanly.
    pub prevent_close: bool,
    /// Do not abort the destination when the source errors.
    pub prevent_abort: bool,
    /// Do not cancel the source when the destination closes or errors first.
    pub prevent_cancel: bool,
}

/// A destination/stream pair where writes into `writable` come out of
/// `readable`, for chaining with [`ReadableStream::pipe_through`].
pub struct TransformPair<W, U: MaybeSend + 'static> {
    pub writable: W,
    pub readable: ReadableStream<U>,
}

impl<T: MaybeSend + 'static> ReadableStream<T> {
    /// Copy every chunk of this stream into `dest`, honoring the
    /// destination's readiness between writes.
    ///
    /// Locks the stream for the duration (fails with
    /// [`StreamError::AlreadyLocked`] if a reader is attached) and releases
    /// it on every exit path. Resolves with `()` after the source closes and
    /// the destination close-out (if any) completes; rejects with the source
    /// error if the source errors, or with a descriptive error if the
    /// destination closes or errors while the pipe is active. The
    /// [`PipeOptions`] flags suppress the corresponding teardown action
    /// without changing the pipe's own outcome.
    pub async fn pipe_to<D>(&self, dest: &D, options: PipeOptions) -> StreamResult<()>
    where
        D: Destination<T>,
    {
        let reader = self.get_reader()?;
        pipe_loop(reader, dest, options).await
    }

    /// Pipe this stream through a transform, returning the readable end
    /// immediately along with the pipe future to be driven by the caller.
    pub fn pipe_through<W, U>(
        self,
        transform: TransformPair<W, U>,
        options: PipeOptions,
    ) -> (
        ReadableStream<U>,
        impl Future<Output = StreamResult<()>> + MaybeSend,
    )
    where
        W: Destination<T>,
        U: MaybeSend + 'static,
    {
        let TransformPair { writable, readable } = transform;
        let fut = async move { self.pipe_to(&writable, options).await };
        (readable, fut)
    }
}

async fn pipe_loop<T, D>(
    reader: StreamReader<T>,
    dest: &D,
    options: PipeOptions,
) -> StreamResult<()>
where
    T: MaybeSend + 'static,
    D: Destination<T>,
{
    // Resolves only if the source errors; an orderly close is the copy
    // loop's to observe.
    let source_errored = Box::pin(async {
        match reader.closed().await {
            Ok(()) => future::pending::<StreamError>().await,
            Err(e) => e,
        }
    });

    let dest_done = Box::pin(async {
        match dest.closed().await {
            Ok(()) => "destination is closed and cannot be piped to anymore".into(),
            Err(e) => e,
        }
    });

    // Read and readiness advance in lockstep; a chunk is only written while
    // the destination reports itself writable. On any failure the loop
    // parks and lets the terminal watchers decide the outcome.
    let copy = Box::pin(async {
        loop {
            let (read, ready) = join!(reader.read(), dest.ready());
            match (read, ready) {
                (Ok(None), Ok(())) => return,
                (Ok(Some(chunk)), Ok(())) => {
                    if dest.state() != DestinationState::Writable
                        || dest.write(chunk).is_err()
                    {
                        future::pending::<()>().await;
                    }
                }
                _ => future::pending::<()>().await,
            }
        }
    });

    let watchers = select(source_errored, dest_done);
    match select(copy, watchers).await {
        // Source exhausted: release the lock, then close the destination
        // unless told otherwise. The watchers are gone by the time close
        // runs, so the destination settling `closed` here is not mistaken
        // for an external close.
        Either::Left(((), watchers)) => {
            drop(watchers);
            reader.release_lock()?;
            if !options.prevent_close
                && matches!(
                    dest.state(),
                    DestinationState::Writable | DestinationState::Waiting
                )
            {
                dest.close().await
            } else {
                Ok(())
            }
        }
        // Source errored: the stream already detached the reader; propagate
        // into the destination unless told otherwise.
        Either::Right((Either::Left((e, _dest_done)), copy)) => {
            drop(copy);
            let _ = reader.release_lock();
            if !options.prevent_abort {
                dest.abort(Some(e.to_string()));
            }
            Err(e)
        }
        // Destination went away first: cancel the source with the reason
        // unless told otherwise. Dropping the copy loop first discards its
        // parked read, so a plain release cannot fail on it.
        Either::Right((Either::Right((reason, _source_errored)), copy)) => {
            drop(copy);
            if options.prevent_cancel {
                reader.release_lock()?;
            } else {
                let _ = reader.cancel(Some(reason.to_string())).await;
            }
            Err(reason)
        }
    }
}
