// SPDX-License-Identifier: MPL-2.0

use core::fmt;

/// The error type which is returned from the APIs of this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// The physical address is outside of DRAM, or an address or size is
    /// not aligned to the minimum page size.
    InvalidAddress,
    /// The mapping conflicts with an existing entry.
    AddressInUse,
    /// Every level-2 table tier is exhausted.
    OutOfMemory,
    /// The unmap size is smaller than the entry that maps the address.
    SizeMismatch,
    /// The configuration cannot be used.
    InvalidConfig,
    /// No SysMMU is registered for the channel.
    NoSuchChannel,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::InvalidAddress => "invalid address",
            Error::AddressInUse => "address already in use",
            Error::OutOfMemory => "out of level-2 table memory",
            Error::SizeMismatch => "size is smaller than the mapped page",
            Error::InvalidConfig => "invalid configuration",
            Error::NoSuchChannel => "no such channel",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
