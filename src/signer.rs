use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::ConfigError;

type HmacSha256 = Hmac<Sha256>;

/// Keyed-hash signing of request messages.
///
/// The key, the message composition and the lowercase hex rendering are part
/// of the contract with the target system.
pub trait Signer: Send + Sync {
    fn sign(&self, message: &str) -> String;
}

/// HMAC-SHA256 signer rendering lowercase hex.
///
/// The MAC is keyed once; every message is signed on a clone of it.
#[derive(Clone)]
pub struct HmacSha256Signer {
    mac: HmacSha256,
}

impl HmacSha256Signer {
    /// Fails when the key is empty rather than signing with it.
    pub fn new(key: impl AsRef<[u8]>) -> Result<Self, ConfigError> {
        let key = key.as_ref();
        if key.is_empty() {
            return Err(ConfigError::MissingSecretKey);
        }
        let mac = HmacSha256::new_from_slice(key).map_err(|e| ConfigError::InvalidValue {
            field: "secret_key",
            reason: e.to_string(),
        })?;
        Ok(Self { mac })
    }
}

impl std::fmt::Debug for HmacSha256Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSha256Signer")
            .field("key", &"<redacted>")
            .finish()
    }
}

impl Signer for HmacSha256Signer {
    fn sign(&self, message: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn matches_rfc_4231_test_case_2() {
        let signer = HmacSha256Signer::new("Jefe").unwrap();
        let sig = signer.sign("what do ya want for nothing?");
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn signature_is_lowercase_hex_of_fixed_length() {
        let signer = HmacSha256Signer::new(b"secret").unwrap();
        let sig = signer.sign("orderId=1:2&amount=1000&token=abc");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn deterministic() {
        let signer = HmacSha256Signer::new("secret").unwrap();
        let message = "orderId=X&amount=Y&token=Z";
        assert_eq!(signer.sign(message), signer.sign(message));
    }

    #[test]
    fn clones_sign_independently() {
        let signer = HmacSha256Signer::new("secret").unwrap();
        let clone = signer.clone();
        let first = signer.sign("orderId=A&amount=1&token=t");
        assert_eq!(clone.sign("orderId=A&amount=1&token=t"), first);
        // Earlier messages do not leak into later MACs
        assert_eq!(signer.sign("orderId=A&amount=1&token=t"), first);
    }

    #[test]
    fn changes_with_every_field() {
        let signer = HmacSha256Signer::new("secret").unwrap();
        let base = signer.sign("orderId=X&amount=Y&token=Z");
        assert_ne!(base, signer.sign("orderId=X2&amount=Y&token=Z"));
        assert_ne!(base, signer.sign("orderId=X&amount=Y2&token=Z"));
        assert_ne!(base, signer.sign("orderId=X&amount=Y&token=Z2"));

        let other = HmacSha256Signer::new("other").unwrap();
        assert_ne!(base, other.sign("orderId=X&amount=Y&token=Z"));
    }

    #[test]
    fn no_collisions_across_distinct_orders() {
        let signer = HmacSha256Signer::new("secret").unwrap();
        let sigs: HashSet<String> = (0..2_000)
            .map(|i| signer.sign(&format!("orderId={i}:0812&amount=1000&token=t")))
            .collect();
        assert_eq!(sigs.len(), 2_000);
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(matches!(
            HmacSha256Signer::new(""),
            Err(ConfigError::MissingSecretKey)
        ));
    }

    #[test]
    fn debug_does_not_leak_key() {
        let signer = HmacSha256Signer::new("hunter2").unwrap();
        assert!(!format!("{signer:?}").contains("hunter2"));
    }
}
