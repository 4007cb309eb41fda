//! Cryptographic primitives for duramap: integrity checksums and the
//! streaming AES-CFB crypter used by encrypted instances.

pub mod aes_cfb;
pub mod crc32;

pub use crc32::{Crc32, crc32};
