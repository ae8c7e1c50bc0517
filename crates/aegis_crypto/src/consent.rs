//! Consent tokens — signed, expiring, scope-limited capabilities.
//!
//! A token ties a session to its initiator, recipient, and a hash of the
//! context the initiator attached to the invite. The signature covers the
//! canonical JSON encoding of every field except `_sig`: keys sorted, no
//! whitespace, UTF-8. serde_json's default object representation keeps keys
//! sorted (BTreeMap); the `preserve_order` feature must never be enabled in
//! this workspace.
//!
//! `scope` is an open map. Recognized keys:
//! - `tools`: list of permitted tool names; empty or absent means any.
//! - `args.max_k`: upper bound on the `k` argument of any tool.
//!
//! Unknown scope keys are ignored here — a token narrows capability, it
//! never widens it, so consumers still apply their own default-deny for
//! capabilities without a scope key.

use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CryptoError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsentToken {
    pub version: String,
    pub session_id: String,
    pub initiator_id: String,
    pub recipient_id: String,
    /// Open scope map; see module docs for recognized keys.
    pub scope: Value,
    /// SHA-256-hex of the redacted context attached to the invite.
    pub context_hash: String,
    /// Expiry, seconds since epoch.
    pub exp: i64,
    #[serde(rename = "_sig", default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

impl ConsentToken {
    pub fn new(
        session_id: impl Into<String>,
        initiator_id: impl Into<String>,
        recipient_id: impl Into<String>,
        scope: Value,
        context_hash: impl Into<String>,
        exp: i64,
    ) -> Self {
        Self {
            version: "1".into(),
            session_id: session_id.into(),
            initiator_id: initiator_id.into(),
            recipient_id: recipient_id.into(),
            scope,
            context_hash: context_hash.into(),
            exp,
            sig: None,
        }
    }

    /// Canonical signing bytes: sorted-key compact JSON of all fields
    /// except `_sig`.
    fn canonical_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("_sig");
        }
        Ok(serde_json::to_vec(&value)?)
    }

    /// Return a copy carrying `_sig` over the canonical bytes.
    pub fn sign(&self, sk: &SigningKey) -> Result<ConsentToken, CryptoError> {
        let msg = self.canonical_bytes()?;
        let sig = sk.sign(&msg);
        let mut signed = self.clone();
        signed.sig = Some(STANDARD.encode(sig.to_bytes()));
        Ok(signed)
    }

    /// Verify expiry and signature. Pure: the token is not mutated.
    ///
    /// False when the token is expired (`exp < now` — a token is still
    /// valid at the `exp == now` boundary), `_sig` is missing or
    /// malformed, or the signature does not cover this token's canonical
    /// re-serialization.
    pub fn verify(&self, vk: &VerifyingKey) -> bool {
        self.verify_at(vk, chrono::Utc::now().timestamp())
    }

    /// Verification against an explicit clock, for tests and replay checks.
    pub fn verify_at(&self, vk: &VerifyingKey, now: i64) -> bool {
        if self.exp < now {
            return false;
        }
        let Some(sig_b64) = self.sig.as_deref() else {
            return false;
        };
        let Ok(sig_bytes) = STANDARD.decode(sig_b64) else {
            return false;
        };
        let sig_arr: [u8; 64] = match sig_bytes.as_slice().try_into() {
            Ok(arr) => arr,
            Err(_) => return false,
        };
        let Ok(msg) = self.canonical_bytes() else {
            return false;
        };
        vk.verify(&msg, &Signature::from_bytes(&sig_arr)).is_ok()
    }

    /// Scope check for a tool invocation.
    ///
    /// Deny when `scope.tools` is a non-empty list not containing `tool`,
    /// or when `scope.args.max_k` is present and `args.k` exceeds it.
    pub fn allows(&self, tool: &str, args: &Value) -> bool {
        if let Some(tools) = self.scope.get("tools").and_then(Value::as_array) {
            if !tools.is_empty() && !tools.iter().any(|t| t.as_str() == Some(tool)) {
                return false;
            }
        }
        if let Some(max_k) = self
            .scope
            .get("args")
            .and_then(|a| a.get("max_k"))
            .and_then(Value::as_i64)
        {
            if let Some(k) = args.get("k").and_then(Value::as_i64) {
                if k > max_k {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use serde_json::json;

    fn token(exp: i64) -> ConsentToken {
        ConsentToken::new(
            "ses-deadbeef",
            "alice",
            "bob",
            json!({"tools": ["kb_query"], "args": {"max_k": 5}}),
            crate::hash::sha256_hex("redacted context"),
            exp,
        )
    }

    #[test]
    fn sign_verify_roundtrip() {
        let sk = SigningKey::generate(&mut OsRng);
        let signed = token(i64::MAX).sign(&sk).unwrap();
        assert!(signed.verify(&sk.verifying_key()));
    }

    #[test]
    fn wire_roundtrip_preserves_signature() {
        let sk = SigningKey::generate(&mut OsRng);
        let signed = token(i64::MAX).sign(&sk).unwrap();
        let wire = serde_json::to_string(&signed).unwrap();
        let back: ConsentToken = serde_json::from_str(&wire).unwrap();
        assert!(back.verify(&sk.verifying_key()));
    }

    #[test]
    fn tampered_fields_fail_verification() {
        let sk = SigningKey::generate(&mut OsRng);
        let signed = token(i64::MAX).sign(&sk).unwrap();
        let vk = sk.verifying_key();

        let mut t = signed.clone();
        t.recipient_id = "mallory".into();
        assert!(!t.verify(&vk));

        let mut t = signed.clone();
        t.scope = json!({"tools": []});
        assert!(!t.verify(&vk));

        let mut t = signed.clone();
        t.context_hash = crate::hash::sha256_hex("other context");
        assert!(!t.verify(&vk));
    }

    #[test]
    fn tampered_signature_byte_fails() {
        let sk = SigningKey::generate(&mut OsRng);
        let signed = token(i64::MAX).sign(&sk).unwrap();
        let vk = sk.verifying_key();

        let sig_b64 = signed.sig.clone().unwrap();
        let mut sig = STANDARD.decode(&sig_b64).unwrap();
        for i in 0..sig.len() {
            sig[i] ^= 0x01;
            let mut t = signed.clone();
            t.sig = Some(STANDARD.encode(&sig));
            assert!(!t.verify(&vk), "flipped byte {i} still verified");
            sig[i] ^= 0x01;
        }
    }

    #[test]
    fn missing_or_garbage_signature_fails() {
        let sk = SigningKey::generate(&mut OsRng);
        let vk = sk.verifying_key();
        let unsigned = token(i64::MAX);
        assert!(!unsigned.verify(&vk));

        let mut garbled = token(i64::MAX);
        garbled.sig = Some("not base64!!".into());
        assert!(!garbled.verify(&vk));

        let mut short = token(i64::MAX);
        short.sig = Some(STANDARD.encode([0u8; 12]));
        assert!(!short.verify(&vk));
    }

    #[test]
    fn expired_token_fails() {
        let sk = SigningKey::generate(&mut OsRng);
        let vk = sk.verifying_key();
        let signed = token(1_000).sign(&sk).unwrap();
        assert!(signed.verify_at(&vk, 999));
        // Expiry is strict: the token still verifies at exactly exp.
        assert!(signed.verify_at(&vk, 1_000));
        assert!(!signed.verify_at(&vk, 1_001));
        assert!(!signed.verify_at(&vk, 2_000));
    }

    #[test]
    fn wrong_key_fails() {
        let sk = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let signed = token(i64::MAX).sign(&sk).unwrap();
        assert!(!signed.verify(&other.verifying_key()));
    }

    #[test]
    fn scope_tool_enforcement() {
        let t = token(i64::MAX);
        assert!(t.allows("kb_query", &json!({})));
        assert!(!t.allows("search_web", &json!({})));

        // Empty/absent tool list means any tool.
        let open = ConsentToken::new("s", "a", "b", json!({}), "h", i64::MAX);
        assert!(open.allows("anything", &json!({})));
        let empty = ConsentToken::new("s", "a", "b", json!({"tools": []}), "h", i64::MAX);
        assert!(empty.allows("anything", &json!({})));
    }

    #[test]
    fn scope_max_k_enforcement() {
        let t = token(i64::MAX);
        assert!(t.allows("kb_query", &json!({"k": 5})));
        assert!(!t.allows("kb_query", &json!({"k": 6})));
        // No k argument: the bound does not apply.
        assert!(t.allows("kb_query", &json!({"query": "x"})));
    }

    #[test]
    fn unknown_scope_keys_ignored() {
        let t = ConsentToken::new(
            "s",
            "a",
            "b",
            json!({"tools": ["kb_query"], "future_capability": {"anything": true}}),
            "h",
            i64::MAX,
        );
        assert!(t.allows("kb_query", &json!({})));
        assert!(!t.allows("other", &json!({})));
    }

    #[test]
    fn canonical_bytes_are_sorted_and_compact() {
        let t = token(42);
        let bytes = t.canonical_bytes().unwrap();
        let s = String::from_utf8(bytes).unwrap();
        assert!(!s.contains(' '));
        assert!(!s.contains("_sig"));
        let ctx = s.find("\"context_hash\"").unwrap();
        let exp = s.find("\"exp\"").unwrap();
        let ver = s.find("\"version\"").unwrap();
        assert!(ctx < exp && exp < ver);
    }
}
