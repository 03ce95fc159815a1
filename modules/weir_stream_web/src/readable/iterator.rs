use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures::Stream;
use weir_utils::{Error, Result};

use super::{ReadableStream, ReadableStreamDefaultReader, ReadableStreamReadResult};

type PendingRead<T> = Pin<Box<dyn Future<Output = Result<ReadableStreamReadResult<T>>>>>;

/// Async iteration over the chunks of a [`ReadableStream`], holding its lock while alive.
///
/// The iterator ends after the stream closes or after yielding the stream's error. Dropping it early
/// cancels the stream, unless it was created with `prevent_cancel`.
pub struct ReadableStreamValues<T: 'static> {
    reader: Option<ReadableStreamDefaultReader<T>>,
    prevent_cancel: bool,
    pending: Option<PendingRead<T>>,
}

impl<T: 'static> fmt::Debug for ReadableStreamValues<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStreamValues")
            .field("finished", &self.reader.is_none())
            .field("prevent_cancel", &self.prevent_cancel)
            .finish()
    }
}

impl<T: 'static> ReadableStream<T> {
    // async iterable<any>(optional ReadableStreamIteratorOptions options = {});
    /// Locks the stream and iterates over its chunks.
    pub fn values(&self, prevent_cancel: bool) -> Result<ReadableStreamValues<T>> {
        // Let reader be ? AcquireReadableStreamDefaultReader(stream).
        let reader = self.get_reader()?;

        // Set iterator’s reader to reader.
        // Let preventCancel be args[0]["preventCancel"].
        // Set iterator’s prevent cancel to preventCancel.
        Ok(ReadableStreamValues {
            reader: Some(reader),
            prevent_cancel,
            pending: None,
        })
    }
}

impl<T: 'static> ReadableStreamValues<T> {
    fn finish(&mut self) {
        self.pending = None;
        if let Some(reader) = self.reader.take() {
            // Perform ! ReadableStreamDefaultReaderRelease(reader).
            reader.release_lock();
        }
    }
}

impl<T: 'static> Stream for ReadableStreamValues<T> {
    type Item = Result<T>;

    // The get the next iteration result steps
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        // Let reader be iterator’s reader.
        let Some(reader) = &this.reader else {
            return Poll::Ready(None);
        };

        // Let readRequest be a new read request with the following items:
        // Perform ! ReadableStreamDefaultReaderRead(this, readRequest).
        let read = this
            .pending
            .get_or_insert_with(|| Box::pin(reader.read()));

        let result = match read.as_mut().poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        this.pending = None;

        match result {
            // chunk steps, given chunk
            // Resolve promise with chunk.
            Ok(ReadableStreamReadResult {
                value: Some(chunk),
                done: false,
            }) => Poll::Ready(Some(Ok(chunk))),
            // close steps
            Ok(_) => {
                // Perform ! ReadableStreamDefaultReaderRelease(reader).
                this.finish();
                // Resolve promise with end of iteration.
                Poll::Ready(None)
            },
            // error steps, given e
            Err(e) => {
                // Perform ! ReadableStreamDefaultReaderRelease(reader).
                this.finish();
                // Reject promise with e.
                Poll::Ready(Some(Err(e)))
            },
        }
    }
}

impl<T: 'static> Drop for ReadableStreamValues<T> {
    // The asynchronous iterator return steps
    fn drop(&mut self) {
        // Let reader be iterator’s reader.
        let Some(reader) = self.reader.as_ref() else {
            return;
        };

        // If iterator’s prevent cancel is false:
        if !self.prevent_cancel {
            // Let result be ! ReadableStreamReaderGenericCancel(reader, arg).
            let _ = reader.cancel(Some(Error::invalid_state("The iterator was dropped")));
        }

        // Perform ! ReadableStreamDefaultReaderRelease(reader).
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use async_trait::async_trait;
    use futures::{stream, StreamExt};
    use weir_test::{flush_jobs, test_async_with};

    use super::*;
    use crate::{
        queuing_strategy::QueuingStrategy,
        readable::{ReadableStreamDefaultController, UnderlyingSource},
    };

    #[tokio::test]
    async fn iterates_in_order_and_releases_on_close() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = ReadableStream::from_stream(stream::iter([Ok(1), Ok(2), Ok(3)]));
                let values: Vec<_> = stream
                    .values(false)
                    .unwrap()
                    .map(|chunk| chunk.unwrap())
                    .collect()
                    .await;
                assert_eq!(values, vec![1, 2, 3]);
                assert!(!stream.locked());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn yields_the_error_then_ends() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = ReadableStream::from_stream(stream::iter([
                    Ok("a"),
                    Err(Error::message("broken")),
                ]));
                let mut values = stream.values(false).unwrap();
                assert_eq!(values.next().await, Some(Ok("a")));
                assert_eq!(values.next().await, Some(Err(Error::message("broken"))));
                assert_eq!(values.next().await, None);
            })
        })
        .await;
    }

    struct Counting {
        cancelled: Rc<Cell<bool>>,
    }

    #[async_trait(?Send)]
    impl UnderlyingSource<u32> for Counting {
        async fn pull(&self, controller: ReadableStreamDefaultController<u32>) -> Result<()> {
            controller.enqueue(7)
        }

        async fn cancel(&self, _reason: Error) -> Result<()> {
            self.cancelled.set(true);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dropping_early_cancels_unless_prevented() {
        test_async_with(|| {
            Box::pin(async move {
                for prevent_cancel in [false, true] {
                    let cancelled = Rc::new(Cell::new(false));
                    let stream = ReadableStream::new(
                        Counting {
                            cancelled: cancelled.clone(),
                        },
                        QueuingStrategy::default(),
                    )
                    .unwrap();

                    let mut values = stream.values(prevent_cancel).unwrap();
                    assert_eq!(values.next().await, Some(Ok(7)));
                    drop(values);
                    flush_jobs().await;

                    assert_eq!(cancelled.get(), !prevent_cancel);
                    assert!(!stream.locked());
                }
            })
        })
        .await;
    }
}
