// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use weir_utils::Error;

use super::AbortSignal;

/// Owner of an [`AbortSignal`]; the only handle that can trigger it.
#[derive(Clone, Debug)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal::new(),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Aborts the signal with `reason`, or with an `AbortError` when none is given.
    /// Only the first call has any effect.
    pub fn abort(&self, reason: Option<Error>) {
        if self.signal.aborted() {
            //only once
            return;
        }
        self.signal.send_aborted(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_only_once() {
        let controller = AbortController::new();
        controller.abort(Some(Error::message("first")));
        controller.abort(Some(Error::message("second")));

        let signal = controller.signal();
        assert!(signal.aborted());
        assert_eq!(signal.reason(), Some(Error::message("first")));
    }

    #[test]
    fn abort_without_reason_uses_abort_error() {
        let controller = AbortController::new();
        controller.abort(None);
        assert!(matches!(controller.signal().reason(), Some(Error::Aborted(_))));
    }
}
