// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//log
pub const ENV_RUST_LOG: &str = "RUST_LOG";

//demo
pub const ENV_WEIR_CHUNK_SIZE: &str = "WEIR_CHUNK_SIZE";
pub const ENV_WEIR_HIGH_WATER_MARK: &str = "WEIR_HIGH_WATER_MARK";

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
