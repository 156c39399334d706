//! Canonicalization and key material.

pub mod jcs;
pub mod keys;
