/*
 * Copyright 2025 The Camhub Contributors
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

use crate::types::TransportType;
use thiserror::Error;

/// All errors in `camhub`.
///
/// Every fallible operation in the capture layer reports one of these
/// variants; backends map their native failure codes onto the same taxonomy
/// so callers never see transport-specific error types.
#[allow(clippy::module_name_repetitions)]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CamhubError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Busy: {0}")]
    Busy(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("Invalid value {value} for property {property}: {reason}")]
    InvalidValue {
        property: String,
        value: String,
        reason: String,
    },
    #[error("Property {0} is not writable")]
    NotWritable(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Transport error on {transport}: {error}")]
    Transport {
        transport: TransportType,
        error: String,
    },
    #[error("Cannot {operation}: pipeline is {state}")]
    InvalidState {
        operation: String,
        state: String,
    },
    #[error("Buffer was reclaimed by the pool")]
    BufferReclaimed,
}

impl CamhubError {
    /// Shorthand for a [`CamhubError::Transport`] with a stringified cause.
    pub fn transport(transport: TransportType, error: impl ToString) -> Self {
        CamhubError::Transport {
            transport,
            error: error.to_string(),
        }
    }

    /// Shorthand for a [`CamhubError::InvalidState`].
    pub fn invalid_state(operation: impl ToString, state: impl ToString) -> Self {
        CamhubError::InvalidState {
            operation: operation.to_string(),
            state: state.to_string(),
        }
    }
}
