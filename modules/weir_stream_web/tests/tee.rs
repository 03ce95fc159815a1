use std::{cell::RefCell, rc::Rc};

use async_trait::async_trait;
use weir_stream_web::{
    Error, QueuingStrategy, ReadableStream, ReadableStreamDefaultController, Result,
    UnderlyingSource,
};
use weir_test::test_async_with;

#[derive(Clone, Default)]
struct Letters {
    cancelled: Rc<RefCell<Option<Error>>>,
}

#[async_trait(?Send)]
impl UnderlyingSource<&'static str> for Letters {
    async fn start(&self, controller: ReadableStreamDefaultController<&'static str>) -> Result<()> {
        controller.enqueue("a")?;
        controller.enqueue("b")?;
        controller.close()
    }

    async fn cancel(&self, reason: Error) -> Result<()> {
        self.cancelled.borrow_mut().replace(reason);
        Ok(())
    }
}

async fn drain(stream: &ReadableStream<&'static str>) -> Vec<&'static str> {
    let reader = stream.get_reader().unwrap();
    let mut chunks = Vec::new();
    loop {
        let result = reader.read().await.unwrap();
        if result.done {
            return chunks;
        }
        chunks.extend(result.value);
    }
}

#[tokio::test]
async fn cancelling_one_branch_leaves_the_other_intact() {
    test_async_with(|| {
        Box::pin(async move {
            let letters = Letters::default();
            let upstream =
                ReadableStream::new(letters.clone(), QueuingStrategy::default()).unwrap();
            let (first, second) = upstream.tee().unwrap();

            // pending until the second branch cancels too
            let _ = first.cancel(Some(Error::message("not needed")));

            assert_eq!(drain(&second).await, vec!["a", "b"]);
            assert!(letters.cancelled.borrow().is_none());
        })
    })
    .await;
}

#[tokio::test]
async fn cancelling_both_branches_cancels_upstream_with_both_reasons() {
    test_async_with(|| {
        Box::pin(async move {
            let letters = Letters::default();
            let upstream = ReadableStream::new(letters.clone(), QueuingStrategy::new(0.0)).unwrap();
            let (first, second) = upstream.tee().unwrap();

            let reason1 = Error::message("first");
            let reason2 = Error::message("second");
            let cancel1 = first.cancel(Some(reason1.clone()));
            let cancel2 = second.cancel(Some(reason2.clone()));

            assert_eq!(cancel1.await, Ok(()));
            assert_eq!(cancel2.await, Ok(()));
            assert_eq!(
                *letters.cancelled.borrow(),
                Some(Error::composite([reason1, reason2]))
            );
        })
    })
    .await;
}
