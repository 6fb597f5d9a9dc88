// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::hal::DmaError;
use crate::Error;

/// What the protocol layer reports back to its requester.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompletionSignal {
    Success,
    Nack,
    Failure,
}

impl CompletionSignal {
    pub fn from_result<T>(r: &Result<T, Error>) -> CompletionSignal {
        match r {
            Ok(_) => CompletionSignal::Success,
            Err(e) => e.completion(),
        }
    }
}

impl Error {
    /// NACKs get their own signal; everything else is a generic failure.
    pub fn completion(&self) -> CompletionSignal {
        match self {
            Error::Dma(DmaError::Nack) => CompletionSignal::Nack,
            _ => CompletionSignal::Failure,
        }
    }
}
