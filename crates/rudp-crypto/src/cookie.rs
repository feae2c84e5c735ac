//! Cookie authentication for the mediator's rendezvous handshake.
//!
//! A cookie binds an 8-byte random number to the mediator's secret and a
//! coarse timestamp bucket via HMAC-SHA256, so a peer cannot forge one
//! without having first received it from the mediator. Cookies come in
//! complementary pairs: peer A and peer B are handed cookies that share
//! the same random number but differ in a single "complementary" bit, so
//! the mediator can tell the two apart without keeping per-peer state
//! until it has seen a `SYN` from each.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use subtle::ConstantTimeEq;
use zeroize::ZeroizeOnDrop;

use crate::{CryptoError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Size of the random number embedded in a cookie.
pub const COOKIE_RAND_SIZE: usize = 8;
/// Size of the HMAC-SHA256 tag appended to a cookie.
pub const HMAC_HASH_SIZE: usize = 32;
/// Total on-wire cookie size (`COOKIE_RAND_SIZE` + `HMAC_HASH_SIZE`).
pub const COOKIE_SIZE: usize = COOKIE_RAND_SIZE + HMAC_HASH_SIZE;
/// Width of a cookie timestamp bucket.
pub const COOKIE_RESOLUTION: Duration = Duration::from_secs(5 * 60);

/// The random number shared by a complementary cookie pair.
pub type CookieRandNum = [u8; COOKIE_RAND_SIZE];

/// A single cookie as handed to a peer (rand number ++ HMAC tag).
pub type Cookie = [u8; COOKIE_SIZE];

/// Generates and verifies rendezvous cookies using a per-mediator secret.
#[derive(ZeroizeOnDrop)]
pub struct CookieAuthority {
    secret: [u8; 32],
}

impl CookieAuthority {
    /// Create an authority with a freshly generated random secret.
    pub fn new() -> Self {
        Self {
            secret: crate::random_bytes(),
        }
    }

    /// Create an authority from an existing secret (e.g. restored across
    /// a restart so in-flight cookies remain valid).
    pub fn from_secret(secret: [u8; 32]) -> Self {
        Self { secret }
    }

    fn bucket(now: Duration) -> u64 {
        now.as_secs() / COOKIE_RESOLUTION.as_secs()
    }

    fn hash(&self, rand: &CookieRandNum, bucket: u64, complementary: bool) -> [u8; HMAC_HASH_SIZE] {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC key size is always valid");
        mac.update(rand);
        mac.update(&bucket.to_be_bytes());
        mac.update(&[if complementary { 1 } else { 0 }]);
        mac.finalize().into_bytes().into()
    }

    /// Generate a complementary cookie pair for the given rendezvous time.
    /// The first element is handed to peer A, the second to peer B.
    pub fn generate_pair(&self, now: Duration) -> (Cookie, Cookie) {
        let rand: CookieRandNum = crate::random_bytes();
        let bucket = Self::bucket(now);

        (
            self.cookie_for(&rand, bucket, false),
            self.cookie_for(&rand, bucket, true),
        )
    }

    fn cookie_for(&self, rand: &CookieRandNum, bucket: u64, complementary: bool) -> Cookie {
        let tag = self.hash(rand, bucket, complementary);
        let mut cookie = [0u8; COOKIE_SIZE];
        cookie[..COOKIE_RAND_SIZE].copy_from_slice(rand);
        cookie[COOKIE_RAND_SIZE..].copy_from_slice(&tag);
        cookie
    }

    /// Verify a cookie presented by a peer. Accepts cookies issued in the
    /// current or the immediately preceding time bucket. On success,
    /// returns the shared random number and which complementary identity
    /// the cookie carries.
    pub fn verify(&self, cookie: &[u8], now: Duration) -> Result<(CookieRandNum, bool)> {
        if cookie.len() != COOKIE_SIZE {
            return Err(CryptoError::InvalidCookieLength {
                expected: COOKIE_SIZE,
                got: cookie.len(),
            });
        }

        let mut rand = CookieRandNum::default();
        rand.copy_from_slice(&cookie[..COOKIE_RAND_SIZE]);
        let tag = &cookie[COOKIE_RAND_SIZE..];

        let bucket = Self::bucket(now);

        for complementary in [false, true] {
            for candidate_bucket in [bucket, bucket.saturating_sub(1)] {
                let expected = self.hash(&rand, candidate_bucket, complementary);
                if bool::from(expected.ct_eq(tag)) {
                    return Ok((rand, complementary));
                }
            }
        }

        Err(CryptoError::CookieVerificationFailed)
    }
}

impl Default for CookieAuthority {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_shares_rand_but_differs_in_complementary_bit() {
        let auth = CookieAuthority::new();
        let now = Duration::from_secs(1_000_000);
        let (a, b) = auth.generate_pair(now);

        assert_eq!(&a[..COOKIE_RAND_SIZE], &b[..COOKIE_RAND_SIZE]);
        assert_ne!(&a[COOKIE_RAND_SIZE..], &b[COOKIE_RAND_SIZE..]);

        let (rand_a, comp_a) = auth.verify(&a, now).unwrap();
        let (rand_b, comp_b) = auth.verify(&b, now).unwrap();
        assert_eq!(rand_a, rand_b);
        assert_ne!(comp_a, comp_b);
    }

    #[test]
    fn verify_accepts_previous_bucket_only() {
        let auth = CookieAuthority::new();
        let now = Duration::from_secs(COOKIE_RESOLUTION.as_secs() * 10);
        let (a, _) = auth.generate_pair(now);

        let one_bucket_later = now + COOKIE_RESOLUTION;
        assert!(auth.verify(&a, one_bucket_later).is_ok());

        let two_buckets_later = now + COOKIE_RESOLUTION * 2;
        assert!(auth.verify(&a, two_buckets_later).is_err());
    }

    #[test]
    fn verify_rejects_tampered_cookie() {
        let auth = CookieAuthority::new();
        let now = Duration::from_secs(1_000_000);
        let (mut a, _) = auth.generate_pair(now);
        a[COOKIE_RAND_SIZE] ^= 0xFF;

        assert!(auth.verify(&a, now).is_err());
    }

    #[test]
    fn verify_rejects_wrong_length() {
        let auth = CookieAuthority::new();
        assert!(matches!(
            auth.verify(&[0u8; 10], Duration::from_secs(0)),
            Err(CryptoError::InvalidCookieLength { .. })
        ));
    }
}
