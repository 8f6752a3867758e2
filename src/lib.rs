//! Buffered, pull-based data streams with backpressure.
//!
//! A [`ReadableStream`] sits between a single producer (a [`Source`]) and a
//! single consumer (a [`StreamReader`]). Chunks flow through an internal
//! sized queue; a pluggable [`QueuingStrategy`] decides when the producer
//! should be throttled, and the stream only pulls from its source while the
//! strategy permits it. Consumption is exclusive: one reader at a time holds
//! the lock, and terminal conditions (close, error, cancel) settle the
//! reader's futures exactly once.
//!
//! Streams are executor-agnostic. The builder either hands back the driver
//! future for the caller to run (`prepare()`) or passes it to any spawner
//! (`spawn(spawn_fn)`):
//!
//! ```
//! use chunkflow::{CountQueuingStrategy, ReadableStream, StreamResult};
//!
//! # async fn demo() -> StreamResult<()> {
//! let stream = ReadableStream::from_vec(vec![1, 2, 3])
//!     .strategy(CountQueuingStrategy::new(4.0))
//!     .spawn(tokio::spawn);
//!
//! let reader = stream.get_reader()?;
//! while let Some(chunk) = reader.read().await? {
//!     println!("{chunk}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The `send` feature (default) uses `Arc` and requires `Send` bounds so
//! streams can cross threads; the `local` feature swaps in `Rc` for
//! single-threaded executors. See [`platform`].

pub mod platform;
pub mod streams;

pub use streams::{
    ByteLengthQueuingStrategy, CompletionCell, CountQueuingStrategy, DefaultQueuingStrategy,
    Destination, DestinationState, IteratorSource, PipeOptions, QueuingStrategy, ReadableStream,
    ReadableStreamBuilder, SizedQueue, Source, StreamController, StreamError, StreamReader,
    StreamResult, StreamState, TransformPair,
};
