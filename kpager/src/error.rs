// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt::{Display, Formatter};

/// Errors surfaced by the pager core.
///
/// Every variant is terminal for the operation at hand; the pager performs
/// no retries. Whoever delivers page faults decides whether a failed fault
/// terminates the faulting task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// The faulting address is not covered by any segment, or the address
    /// space is being torn down.
    NoSegment,
    /// The kernel could not allocate physical memory for a backing block.
    AllocationFailed,
    /// The external memory provider was unreachable or returned no usable
    /// capability.
    ProviderUnavailable,
    /// The kernel refused to derive a restricted capability view, e.g.
    /// because the parent capability was already revoked.
    DerivationFailed,
    /// A map request overlaps an existing segment.
    AlreadyMapped,
    /// A map request is not aligned to the page size.
    Misaligned,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::NoSegment => {
                f.write_str("no segment covers the faulting address, or the address space is gone")
            }
            Error::AllocationFailed => f.write_str("physical memory allocation failed"),
            Error::ProviderUnavailable => {
                f.write_str("the external memory provider failed or returned no capability")
            }
            Error::DerivationFailed => {
                f.write_str("the kernel refused to derive a restricted capability")
            }
            Error::AlreadyMapped => f.write_str("the requested range overlaps an existing segment"),
            Error::Misaligned => f.write_str("the requested range is not page aligned"),
        }
    }
}

impl core::error::Error for Error {}

#[macro_export]
macro_rules! ensure {
    ($cond:expr, $error:expr, $msg:expr) => {
        if !$cond {
            log::error!($msg);
            return Err($error);
        }
    };
    ($cond:expr, $error:expr) => {
        if !$cond {
            return Err($error);
        }
    };
}

#[macro_export]
macro_rules! bail {
    ($error:expr) => {
        return Err($error);
    };
    ($error:expr, $msg:expr) => {
        log::error!($msg);
        return Err($error);
    };
}
