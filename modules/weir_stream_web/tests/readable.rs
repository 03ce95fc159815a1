use std::{cell::RefCell, rc::Rc};

use async_trait::async_trait;
use weir_stream_web::{
    Error, QueuingStrategy, ReadableStream, ReadableStreamDefaultController,
    ReadableStreamDefaultReader, Result, UnderlyingSource,
};
use weir_test::{flush_jobs, test_async_with};

// Hands its controller out so the test can play producer.
#[derive(Clone, Default)]
struct Handle {
    controller: Rc<RefCell<Option<ReadableStreamDefaultController<u32>>>>,
}

impl Handle {
    fn controller(&self) -> ReadableStreamDefaultController<u32> {
        self.controller.borrow().clone().unwrap()
    }
}

#[async_trait(?Send)]
impl UnderlyingSource<u32> for Handle {
    async fn start(&self, controller: ReadableStreamDefaultController<u32>) -> Result<()> {
        self.controller.borrow_mut().replace(controller);
        Ok(())
    }
}

async fn next(reader: &ReadableStreamDefaultReader<u32>) -> Option<u32> {
    reader.read().await.unwrap().value
}

#[tokio::test]
async fn values_arrive_in_enqueue_order_whether_queued_or_direct() {
    test_async_with(|| {
        Box::pin(async move {
            let handle = Handle::default();
            let stream = ReadableStream::new(handle.clone(), QueuingStrategy::new(8.0)).unwrap();
            flush_jobs().await;
            let controller = handle.controller();

            // queued
            controller.enqueue(1).unwrap();
            controller.enqueue(2).unwrap();
            let reader = stream.get_reader().unwrap();
            assert_eq!(next(&reader).await, Some(1));

            // the queue still holds 2, so this read is answered from it
            let second = reader.read();
            // direct fulfilment of a waiting read
            let third = reader.read();
            controller.enqueue(3).unwrap();
            controller.enqueue(4).unwrap();
            controller.close().unwrap();

            assert_eq!(second.await.unwrap().value, Some(2));
            assert_eq!(third.await.unwrap().value, Some(3));
            assert_eq!(next(&reader).await, Some(4));
            assert!(reader.read().await.unwrap().done);
        })
    })
    .await;
}

#[tokio::test]
async fn desired_size_follows_the_high_water_mark() {
    test_async_with(|| {
        Box::pin(async move {
            let handle = Handle::default();
            let stream = ReadableStream::new(handle.clone(), QueuingStrategy::new(4.0)).unwrap();
            flush_jobs().await;
            let controller = handle.controller();

            for (chunk, expected) in [(1, 3.0), (2, 2.0), (3, 1.0)] {
                controller.enqueue(chunk).unwrap();
                assert_eq!(controller.desired_size(), Some(expected));
            }
            controller.enqueue(4).unwrap();
            assert_eq!(controller.desired_size(), Some(0.0));

            let reader = stream.get_reader().unwrap();
            assert_eq!(next(&reader).await, Some(1));
            assert_eq!(next(&reader).await, Some(2));
            assert_eq!(controller.desired_size(), Some(2.0));

            controller.enqueue(5).unwrap();
            assert_eq!(controller.desired_size(), Some(1.0));
            controller.enqueue(6).unwrap();
            assert_eq!(controller.desired_size(), Some(0.0));
        })
    })
    .await;
}

#[tokio::test]
async fn one_reader_at_a_time() {
    test_async_with(|| {
        Box::pin(async move {
            let stream = ReadableStream::<u32>::from_stream(futures::stream::iter([Ok(1)]));

            let reader = stream.get_reader().unwrap();
            assert!(stream.locked());
            assert!(matches!(stream.get_reader(), Err(Error::InvalidState(_))));

            reader.release_lock();
            assert!(!stream.locked());

            let reader = stream.get_reader().unwrap();
            assert_eq!(next(&reader).await, Some(1));
        })
    })
    .await;
}

#[tokio::test]
async fn erroring_rejects_pending_reads_and_closed() {
    test_async_with(|| {
        Box::pin(async move {
            let handle = Handle::default();
            let stream = ReadableStream::new(handle.clone(), QueuingStrategy::default()).unwrap();
            flush_jobs().await;

            let reader = stream.get_reader().unwrap();
            let pending = reader.read();
            let reason = Error::message("producer failed");
            handle.controller().error(Some(reason.clone()));

            assert_eq!(pending.await, Err(reason.clone()));
            assert_eq!(reader.closed().await, Err(reason.clone()));
            // errored is terminal
            assert_eq!(reader.read().await, Err(reason));
        })
    })
    .await;
}
