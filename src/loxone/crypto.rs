//! Hashing primitives for the token handshake.

use super::codec::CodecError;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Hash algorithm announced by the Miniserver in its `getkey2` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl From<&str> for HashAlgorithm {
    /// Unknown names fall back to SHA-1, which older firmware uses.
    fn from(name: &str) -> Self {
        if name.eq_ignore_ascii_case("SHA256") {
            HashAlgorithm::Sha256
        } else {
            HashAlgorithm::Sha1
        }
    }
}

/// Hash `password:salt`, rendered as uppercase hex.
pub fn hash_password(password: &str, salt: &str, alg: HashAlgorithm) -> String {
    let payload = format!("{}:{}", password, salt);
    let digest = match alg {
        HashAlgorithm::Sha1 => Sha1::digest(payload.as_bytes()).to_vec(),
        HashAlgorithm::Sha256 => Sha256::digest(payload.as_bytes()).to_vec(),
    };
    hex::encode_upper(digest)
}

/// HMAC `message` with the hex-encoded one-time key, rendered as lowercase hex.
pub fn compute_auth_code(
    key_hex: &str,
    message: &str,
    alg: HashAlgorithm,
) -> Result<String, CodecError> {
    let key = hex::decode(key_hex).map_err(|_| CodecError::InvalidKeyEncoding)?;

    // HMAC accepts keys of any length, so new_from_slice cannot fail here.
    let mac = match alg {
        HashAlgorithm::Sha1 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(&key)
                .map_err(|_| CodecError::InvalidKeyEncoding)?;
            mac.update(message.as_bytes());
            mac.finalize().into_bytes().to_vec()
        }
        HashAlgorithm::Sha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(&key)
                .map_err(|_| CodecError::InvalidKeyEncoding)?;
            mac.update(message.as_bytes());
            mac.finalize().into_bytes().to_vec()
        }
    };

    Ok(hex::encode(mac))
}
