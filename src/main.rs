// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{env, error::Error, time::Instant};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, Stdin, Stdout},
    sync::Mutex,
    task::LocalSet,
};
use tracing::trace;
use weir::{
    environment::{DEFAULT_CHUNK_SIZE, ENV_WEIR_CHUNK_SIZE, ENV_WEIR_HIGH_WATER_MARK},
    minimal_tracer::MinimalTracer,
    ArrayBufferView, QueuingStrategy, ReadableByteStreamController, ReadableStream,
    StreamPipeOptions, UnderlyingByteSource, UnderlyingSink, WritableStream,
    WritableStreamDefaultController,
};

#[cfg(not(target_os = "windows"))]
#[global_allocator]
static ALLOC: snmalloc_rs::SnMalloc = snmalloc_rs::SnMalloc;

struct StdinSource {
    stdin: Mutex<Stdin>,
    chunk_size: usize,
}

#[async_trait(?Send)]
impl UnderlyingByteSource for StdinSource {
    async fn pull(&self, controller: ReadableByteStreamController) -> weir::Result<()> {
        let mut buffer = vec![0; self.chunk_size];
        let read = self
            .stdin
            .lock()
            .await
            .read(&mut buffer)
            .await
            .map_err(weir::Error::other)?;

        if read == 0 {
            trace!("stdin reached end of file");
            return controller.close();
        }

        buffer.truncate(read);
        controller.enqueue(ArrayBufferView::new(buffer))
    }
}

struct StdoutSink {
    stdout: Mutex<Stdout>,
}

#[async_trait(?Send)]
impl UnderlyingSink<ArrayBufferView> for StdoutSink {
    async fn write(
        &self,
        chunk: ArrayBufferView,
        _controller: WritableStreamDefaultController<ArrayBufferView>,
    ) -> weir::Result<()> {
        self.stdout
            .lock()
            .await
            .write_all(chunk.as_bytes())
            .await
            .map_err(weir::Error::other)
    }

    async fn close(&self) -> weir::Result<()> {
        self.stdout
            .lock()
            .await
            .flush()
            .await
            .map_err(weir::Error::other)
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok()?.parse().ok()
}

async fn copy_stdin_to_stdout() -> weir::Result<()> {
    let chunk_size = env_number::<usize>(ENV_WEIR_CHUNK_SIZE)
        .filter(|size| *size > 0)
        .unwrap_or(DEFAULT_CHUNK_SIZE);
    let strategy = match env_number::<f64>(ENV_WEIR_HIGH_WATER_MARK) {
        Some(high_water_mark) => QueuingStrategy::new(high_water_mark),
        None => QueuingStrategy::default(),
    };

    let readable = ReadableStream::new_bytes(
        StdinSource {
            stdin: Mutex::new(tokio::io::stdin()),
            chunk_size,
        },
        strategy,
    )?;
    let writable = WritableStream::new(
        StdoutSink {
            stdout: Mutex::new(tokio::io::stdout()),
        },
        QueuingStrategy::default(),
    )?;

    readable
        .pipe_to(&writable, StreamPipeOptions::default())
        .await
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let now = Instant::now();

    MinimalTracer::register()?;
    trace!("Started weir {}", weir::VERSION);

    LocalSet::new().run_until(copy_stdin_to_stdout()).await?;
    trace!("Copied stdin to stdout in {}ms", now.elapsed().as_millis());

    Ok(())
}
