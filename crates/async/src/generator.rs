//! Push-to-pull adaptation of event sources.
//!
//! Callback-driven sources (message listeners, body chunk handlers) push items
//! through an [`Emitter`]; consumers pull them from the paired
//! [`AsyncGenerator`], which implements [`futures::Stream`].
//!
//! ```
//! use futures::StreamExt;
//! use micro_async::{generator::generate, EventLoop};
//!
//! let event_loop = EventLoop::virtual_time();
//! let mut numbers = generate(|emitter| {
//!     for n in 1..=3 {
//!         emitter.emit(n);
//!     }
//!     emitter.close();
//! });
//!
//! let collected = event_loop
//!     .block_on(async move {
//!         let mut out = Vec::new();
//!         while let Some(item) = numbers.next().await {
//!             out.push(item?);
//!         }
//!         Ok(out)
//!     })
//!     .unwrap();
//! assert_eq!(collected, vec![1, 2, 3]);
//! ```

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::Stream;
use futures::stream::FusedStream;

use crate::AsyncError;

struct Buffer<T> {
    items: VecDeque<Result<T, AsyncError>>,
    closed: bool,
    consumer_gone: bool,
    terminated: bool,
    waiting: Option<Waker>,
}

/// The producing half of a generator. Clones feed the same buffer.
pub struct Emitter<T> {
    buffer: Rc<RefCell<Buffer<T>>>,
}

/// A single-pass, ordered stream of the items pushed through its [`Emitter`].
///
/// End-of-stream is reported only after every buffered item was delivered.
/// A failure pushed with [`Emitter::fail`] is delivered in order and ends the
/// stream.
pub struct AsyncGenerator<T> {
    buffer: Rc<RefCell<Buffer<T>>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self { buffer: Rc::clone(&self.buffer) }
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buffer = self.buffer.borrow();
        f.debug_struct("Emitter").field("buffered", &buffer.items.len()).field("closed", &buffer.closed).finish()
    }
}

impl<T> fmt::Debug for AsyncGenerator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buffer = self.buffer.borrow();
        f.debug_struct("AsyncGenerator")
            .field("buffered", &buffer.items.len())
            .field("closed", &buffer.closed)
            .field("terminated", &buffer.terminated)
            .finish()
    }
}

/// Creates a generator and hands its emitter to `producer`.
///
/// `producer` typically registers callbacks that keep a clone of the emitter,
/// so items keep flowing after this function returns.
pub fn generate<T, F>(producer: F) -> AsyncGenerator<T>
where
    F: FnOnce(Emitter<T>),
{
    let (emitter, generator) = channel();
    producer(emitter);
    generator
}

/// Creates a connected emitter/generator pair.
pub fn channel<T>() -> (Emitter<T>, AsyncGenerator<T>) {
    let buffer = Rc::new(RefCell::new(Buffer {
        items: VecDeque::new(),
        closed: false,
        consumer_gone: false,
        terminated: false,
        waiting: None,
    }));
    (Emitter { buffer: Rc::clone(&buffer) }, AsyncGenerator { buffer })
}

impl<T> Emitter<T> {
    fn push(&self, item: Result<T, AsyncError>, close: bool) -> bool {
        let waker = {
            let mut buffer = self.buffer.borrow_mut();
            if buffer.closed || buffer.consumer_gone {
                return false;
            }
            buffer.items.push_back(item);
            buffer.closed = close;
            buffer.waiting.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    /// Buffers `item`. Returns `false` if the generator was closed or its
    /// consumer dropped, in which case the item is discarded.
    pub fn emit(&self, item: T) -> bool {
        self.push(Ok(item), false)
    }

    /// Queues `error` after the already buffered items and closes the
    /// generator.
    pub fn fail(&self, error: AsyncError) -> bool {
        self.push(Err(error), true)
    }

    /// Signals end-of-stream. Idempotent.
    pub fn close(&self) {
        let waker = {
            let mut buffer = self.buffer.borrow_mut();
            if buffer.closed {
                return;
            }
            buffer.closed = true;
            buffer.waiting.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn is_closed(&self) -> bool {
        let buffer = self.buffer.borrow();
        buffer.closed || buffer.consumer_gone
    }
}

impl<T> AsyncGenerator<T> {
    /// Number of items produced but not consumed yet.
    pub fn pending_len(&self) -> usize {
        self.buffer.borrow().items.len()
    }
}

impl<T> Stream for AsyncGenerator<T> {
    type Item = Result<T, AsyncError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut buffer = self.buffer.borrow_mut();
        if let Some(item) = buffer.items.pop_front() {
            return Poll::Ready(Some(item));
        }

        if buffer.closed {
            buffer.terminated = true;
            buffer.waiting = None;
            return Poll::Ready(None);
        }

        buffer.waiting = Some(cx.waker().clone());
        Poll::Pending
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let buffer = self.buffer.borrow();
        let buffered = buffer.items.len();
        if buffer.closed { (buffered, Some(buffered)) } else { (buffered, None) }
    }
}

impl<T> FusedStream for AsyncGenerator<T> {
    fn is_terminated(&self) -> bool {
        self.buffer.borrow().terminated
    }
}

impl<T> Drop for AsyncGenerator<T> {
    fn drop(&mut self) {
        let mut buffer = self.buffer.borrow_mut();
        buffer.consumer_gone = true;
        buffer.items.clear();
    }
}
