// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{future::Future, pin::Pin};

use tokio::task::LocalSet;

/// Number of scheduler turns [`flush_jobs`] yields for.
const FLUSH_TURNS: usize = 64;

/// Runs `func` to completion on a fresh [`LocalSet`], so that the engine can spawn its
/// local reaction tasks.
pub async fn test_async_with<F>(func: F)
where
    F: FnOnce() -> Pin<Box<dyn Future<Output = ()>>>,
{
    test_async_with_opts(func, TestOptions::default()).await;
}

#[derive(Default)]
pub struct TestOptions {
    flush_jobs: bool,
}

impl TestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let queued reactions run after the test body returns.
    pub fn flush_jobs(mut self) -> Self {
        self.flush_jobs = true;
        self
    }
}

pub async fn test_async_with_opts<F>(func: F, options: TestOptions)
where
    F: FnOnce() -> Pin<Box<dyn Future<Output = ()>>>,
{
    let local = LocalSet::new();

    local
        .run_until(async move {
            func().await;

            if options.flush_jobs {
                flush_jobs().await;
            }
        })
        .await;
}

/// Yields to the local scheduler until every reaction that is ready to run has run.
pub async fn flush_jobs() {
    for _ in 0..FLUSH_TURNS {
        tokio::task::yield_now().await;
    }
}
