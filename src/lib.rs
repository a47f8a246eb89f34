//! cdnpatch - incremental patcher for CDN-hosted client releases
//!
//! Compares release manifests, pulls whatever changed from the origin
//! (opportunistically through coalesced ranged package downloads) and keeps
//! archive members in append-only containers that can be compacted later.

pub mod archive;
pub mod downloaders;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod patcher;
pub mod paths;

#[cfg(test)]
mod testutil;
