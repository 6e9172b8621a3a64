// Copyright 2025 Rockchip Electronics Co., Ltd.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Error kinds surfaced across the component store and the video components.
///
/// These map one-to-one onto the status codes the host framework understands.
/// `SignalledError` is terminal: once a component reports it, every
/// subsequent call on that component fails fast until the host resets it.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum C2Error {
    #[error("component or resource not found")]
    NotFound,
    #[error("allocator returned no memory")]
    NoMemory,
    #[error("deadline exceeded")]
    TimedOut,
    #[error("invalid parameter or metadata")]
    BadValue,
    #[error("stream corruption reported by the codec engine")]
    Corrupted,
    #[error("capability not permitted on this platform")]
    Refused,
    #[error("feature not implemented")]
    Omitted,
    #[error("operation invalid in the current component state")]
    BadState,
    #[error("component signalled an unrecoverable error")]
    SignalledError,
}

pub type C2Result<T> = std::result::Result<T, C2Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable() {
        assert_eq!(C2Error::NotFound.to_string(), "component or resource not found");
        assert_eq!(C2Error::Omitted.to_string(), "feature not implemented");
    }
}
