use answerpipe_core::{Error, PersistedPayload, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// The exact bytes both sides authenticate: the payload's canonical JSON
/// (field order fixed by the struct) wrapped with the nonce. Sign and verify
/// must go through this one function or signatures stop lining up.
fn canonical_bytes(payload: &PersistedPayload, nonce: &Uuid) -> Result<Vec<u8>> {
    let payload_json = serde_json::to_string(payload).map_err(|e| Error::Sign(e.to_string()))?;
    Ok(format!("{{\"payload\":{payload_json},\"nonce\":\"{nonce}\"}}").into_bytes())
}

pub fn sign(payload: &PersistedPayload, nonce: &Uuid, key: &[u8]) -> Result<String> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| Error::Sign(e.to_string()))?;
    mac.update(&canonical_bytes(payload, nonce)?);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Never panics; any internal failure reads as "not verified".
pub fn verify(payload: &PersistedPayload, nonce: &Uuid, signature: &str, key: &[u8]) -> bool {
    match sign(payload, nonce, key) {
        Ok(expected) => constant_time_eq(expected.as_bytes(), signature.as_bytes()),
        Err(_) => false,
    }
}

#[derive(Clone)]
pub struct PersistenceSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for PersistenceSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("PersistenceSigner").finish_non_exhaustive()
    }
}

impl PersistenceSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    pub fn from_env() -> Result<Self> {
        let key = crate::env_nonempty("ANSWERPIPE_SIGNING_KEY").ok_or_else(|| {
            Error::NotConfigured("missing ANSWERPIPE_SIGNING_KEY".to_string())
        })?;
        Ok(Self::new(key.into_bytes()))
    }

    pub fn sign(&self, payload: &PersistedPayload, nonce: &Uuid) -> Result<String> {
        sign(payload, nonce, &self.key)
    }

    pub fn verify(&self, payload: &PersistedPayload, nonce: &Uuid, signature: &str) -> bool {
        let ok = verify(payload, nonce, signature, &self.key);
        if !ok {
            tracing::warn!(
                workflow_id = %payload.workflow_id,
                "persisted payload signature verification failed"
            );
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use answerpipe_core::{SourceKind, WebResearchSource};

    fn payload() -> PersistedPayload {
        PersistedPayload {
            assistant_message_id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            answer: "The answer, with citations [1].".to_string(),
            web_research_sources: vec![WebResearchSource {
                context_id: Uuid::now_v7(),
                kind: SourceKind::SearchResult,
                url: Some("https://example.com/a".to_string()),
                title: Some("A".to_string()),
                timestamp_ms: 1_700_000_000_000,
                relevance_score: Some(0.8),
            }],
        }
    }

    #[test]
    fn sign_verify_round_trip() {
        let p = payload();
        let nonce = Uuid::now_v7();
        let key = b"test-signing-key";
        let sig = sign(&p, &nonce, key).unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(verify(&p, &nonce, &sig, key));
    }

    #[test]
    fn any_single_byte_change_breaks_verification() {
        let p = payload();
        let nonce = Uuid::now_v7();
        let key = b"test-signing-key";
        let sig = sign(&p, &nonce, key).unwrap();

        let mut tampered = p.clone();
        tampered.answer.replace_range(0..1, "t");
        assert!(!verify(&tampered, &nonce, &sig, key));

        let other_nonce = Uuid::now_v7();
        assert!(!verify(&p, &other_nonce, &sig, key));

        assert!(!verify(&p, &nonce, &sig, b"other-key"));
    }

    #[test]
    fn tampered_signature_fails_without_panicking() {
        let p = payload();
        let nonce = Uuid::now_v7();
        let key = b"test-signing-key";
        let mut sig = sign(&p, &nonce, key).unwrap();
        let flipped = if sig.ends_with('0') { "1" } else { "0" };
        sig.replace_range(sig.len() - 1.., flipped);
        assert!(!verify(&p, &nonce, &sig, key));
        assert!(!verify(&p, &nonce, "", key));
        assert!(!verify(&p, &nonce, "zz-not-hex", key));
    }

    #[test]
    fn constant_time_eq_checks_length_first() {
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"sbme"));
    }

    #[test]
    fn signer_struct_uses_env_key_material() {
        let signer = PersistenceSigner::new(b"k".to_vec());
        let p = payload();
        let nonce = Uuid::now_v7();
        let sig = signer.sign(&p, &nonce).unwrap();
        assert!(signer.verify(&p, &nonce, &sig));
        assert!(!PersistenceSigner::new(b"other".to_vec()).verify(&p, &nonce, &sig));
    }
}
