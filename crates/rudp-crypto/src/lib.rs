//! Cryptographic primitives for the rudp mediator.
//!
//! This crate is deliberately narrow: the transport carries no payload
//! encryption, so the only cryptography involved is the HMAC-based cookie
//! scheme the mediator uses to authenticate rendezvous requests without
//! keeping per-peer state before a handshake completes.
//!
//! # Security principles
//! - Constant-time comparisons for cookie verification
//! - No custom cryptography - only well-audited implementations

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod cookie;
pub mod error;

pub use cookie::{
    Cookie, CookieAuthority, CookieRandNum, COOKIE_RAND_SIZE, COOKIE_RESOLUTION, COOKIE_SIZE,
    HMAC_HASH_SIZE,
};
pub use error::{CryptoError, Result};

/// Securely generate random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut buf);
    buf
}
