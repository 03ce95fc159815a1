// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
pub mod error;
pub mod promise;

pub use error::{Error, Result};
pub use promise::{Promise, ResolveablePromise};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
