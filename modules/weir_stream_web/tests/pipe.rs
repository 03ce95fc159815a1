use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use async_trait::async_trait;
use weir_stream_web::{
    Error, QueuingStrategy, ReadableStream, ReadableStreamDefaultController, Result,
    StreamPipeOptions, TransformStream, TransformStreamDefaultController, Transformer,
    UnderlyingSink, UnderlyingSource, WritableStream, WritableStreamDefaultController,
};
use weir_test::{flush_jobs, test_async_with};

#[derive(Clone, Default)]
struct Source {
    controller: Rc<RefCell<Option<ReadableStreamDefaultController<u32>>>>,
    cancels: Rc<Cell<usize>>,
}

#[async_trait(?Send)]
impl UnderlyingSource<u32> for Source {
    async fn start(&self, controller: ReadableStreamDefaultController<u32>) -> Result<()> {
        self.controller.borrow_mut().replace(controller);
        Ok(())
    }

    async fn cancel(&self, _reason: Error) -> Result<()> {
        self.cancels.set(self.cancels.get() + 1);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct Sink {
    controller: Rc<RefCell<Option<WritableStreamDefaultController<u32>>>>,
    written: Rc<RefCell<Vec<u32>>>,
    aborts: Rc<Cell<usize>>,
}

#[async_trait(?Send)]
impl UnderlyingSink<u32> for Sink {
    async fn start(&self, controller: WritableStreamDefaultController<u32>) -> Result<()> {
        self.controller.borrow_mut().replace(controller);
        Ok(())
    }

    async fn write(
        &self,
        chunk: u32,
        _controller: WritableStreamDefaultController<u32>,
    ) -> Result<()> {
        self.written.borrow_mut().push(chunk);
        Ok(())
    }

    async fn abort(&self, _reason: Error) -> Result<()> {
        self.aborts.set(self.aborts.get() + 1);
        Ok(())
    }
}

// Fails both ends of a running pipe, one after the other, and checks that only the first failure
// shuts the pipe down.
async fn fail_both_ends(source_first: bool) {
    let source = Source::default();
    let sink = Sink::default();
    let readable = ReadableStream::new(source.clone(), QueuingStrategy::default()).unwrap();
    let writable = WritableStream::new(sink.clone(), QueuingStrategy::default()).unwrap();

    let piped = readable.pipe_to(&writable, StreamPipeOptions::default());
    flush_jobs().await;

    let source_controller = source.controller.borrow().clone().unwrap();
    let sink_controller = sink.controller.borrow().clone().unwrap();
    source_controller.enqueue(1).unwrap();
    flush_jobs().await;
    assert_eq!(*sink.written.borrow(), vec![1]);
    assert!(piped.is_pending());

    let source_error = Error::message("source broke");
    let sink_error = Error::message("sink broke");
    let (first, second) = if source_first {
        (source_error.clone(), sink_error.clone())
    } else {
        (sink_error.clone(), source_error.clone())
    };

    if source_first {
        source_controller.error(Some(first.clone()));
    } else {
        sink_controller.error(Some(first.clone()));
    }
    flush_jobs().await;

    // an errored source aborts the sink, an errored sink cancels the source
    assert_eq!(sink.aborts.get() + source.cancels.get(), 1);
    assert_eq!(sink.aborts.get(), usize::from(source_first));
    assert_eq!(piped.result(), Some(Err(first.clone())));
    assert!(!readable.locked());
    assert!(!writable.locked());

    if source_first {
        sink_controller.error(Some(second));
    } else {
        source_controller.error(Some(second));
    }
    flush_jobs().await;

    assert_eq!(sink.aborts.get() + source.cancels.get(), 1);
    assert_eq!(piped.result(), Some(Err(first.clone())));
    assert_eq!(piped.await, Err(first));
}

#[tokio::test]
async fn source_failure_settles_the_pipe_once() {
    test_async_with(|| Box::pin(fail_both_ends(true))).await;
}

#[tokio::test]
async fn sink_failure_settles_the_pipe_once() {
    test_async_with(|| Box::pin(fail_both_ends(false))).await;
}

struct Doubler;

#[async_trait(?Send)]
impl Transformer<u32, u32> for Doubler {
    async fn transform(
        &self,
        chunk: u32,
        controller: TransformStreamDefaultController<u32, u32>,
    ) -> Result<()> {
        controller.enqueue(chunk)?;
        controller.enqueue(chunk)
    }
}

#[tokio::test]
async fn pipe_through_a_transform() {
    test_async_with(|| {
        Box::pin(async move {
            let source =
                ReadableStream::from_stream(futures::stream::iter([Ok(1u32), Ok(2), Ok(3)]));
            let transform = TransformStream::new(
                Doubler,
                QueuingStrategy::default(),
                QueuingStrategy::default(),
            )
            .unwrap();

            let output = source.pipe_through(&transform, StreamPipeOptions::default()).unwrap();
            assert!(source.locked());

            let reader = output.get_reader().unwrap();
            let mut seen = Vec::new();
            loop {
                let result = reader.read().await.unwrap();
                if result.done {
                    break;
                }
                seen.extend(result.value);
            }
            assert_eq!(seen, vec![1, 1, 2, 2, 3, 3]);

            flush_jobs().await;
            assert!(!source.locked());
            assert!(!transform.writable().locked());
        })
    })
    .await;
}

#[tokio::test]
async fn cancelling_the_output_cancels_the_source() {
    test_async_with(|| {
        Box::pin(async move {
            let source = Source::default();
            let readable =
                ReadableStream::new(source.clone(), QueuingStrategy::default()).unwrap();
            let transform =
                TransformStream::identity(QueuingStrategy::default(), QueuingStrategy::default())
                    .unwrap();

            let output = readable.pipe_through(&transform, StreamPipeOptions::default()).unwrap();
            flush_jobs().await;

            assert_eq!(output.cancel(Some(Error::message("done early"))).await, Ok(()));
            flush_jobs().await;
            assert_eq!(source.cancels.get(), 1);
            assert!(!readable.locked());
        })
    })
    .await;
}
