//! Transparent per-sector encryption for block devices.
//!
//! A [`CryptMapping`] interposes between an upper block client and a lower
//! [`BlockDevice`], presenting a virtual device whose every sector is stored
//! encrypted at rest. Reads decrypt on the way up; writes encrypt on the way
//! down. The mapping is per-sector and stateless across sectors, so the same
//! plaintext sector always lands at the same ciphertext location and the
//! layout is crash-safe at sector granularity without a journal.
//!
//! The cipher and IV discipline are chosen by a positional table string, e.g.
//! `"aes-cbc-essiv:sha256 <hexkey> 0 /dev/lower 0"`. See [`CryptMapping::new`]
//! for the grammar.

#[macro_use]
extern crate bitflags;

pub mod api;
pub use api::*;
pub mod backend;
pub use backend::mapping::CryptMapping;
pub use backend::bio::{Bio, BioOp, BioVec, PageBuf};
pub use backend::hosted::MemDevice;

#[cfg(test)]
mod tests;
