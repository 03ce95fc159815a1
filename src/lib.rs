// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
pub mod environment;
pub mod minimal_tracer;

pub use weir_abort::AbortListenerId;
pub use weir_stream_web::*;
pub use weir_utils::ResolveablePromise;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
