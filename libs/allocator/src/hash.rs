//! Reservation credential hashing.
//!
//! The user-supplied credential is hashed immediately on entry; only the
//! hash crosses into the provisioner, which hands it to `usermod -p`.
//! That fixes the scheme to SHA-512-crypt (`$6$`), the form Linux shadow
//! entries expect.

use sha_crypt::{sha512_simple, Sha512Params};
use thiserror::Error;

const ROUNDS: usize = 5_000;

#[derive(Debug, Error)]
#[error("credential hashing failed")]
pub struct HashError;

/// Hash a reservation credential into a `$6$` shadow-style string.
pub fn sha512_crypt(credential: &str) -> Result<String, HashError> {
    let params = Sha512Params::new(ROUNDS).map_err(|_| HashError)?;
    sha512_simple(credential, &params).map_err(|_| HashError)
}
