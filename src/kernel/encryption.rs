// ── Kernel: Envelope Codec & Key Provider ───────────────────────────────────
//
// Authenticated encryption for sensitive memory content.
// AES-256-GCM with per-encryption random 96-bit nonces; the AAD binds
// every ciphertext to its record identity (kind, key, ts) so envelopes
// cannot be swapped between rows without failing authentication.
//
// The envelope is self-describing JSON: key rotation changes `kid`
// without changing `scheme`, and readers reject any scheme mismatch.
//
// Keys come from the environment (BME_KEY_STANDARD / BME_KEY_STRONG,
// URL-safe base64, 32 bytes). Missing keys get an ephemeral in-process
// replacement with a single warning — the synthetic kid still lands in
// the envelope, so decryption failures after a restart are unambiguous.

use std::collections::HashMap;
use std::sync::Arc;

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use log::{error, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::atoms::constants::{
    ALG_AES_GCM, ENC_SCHEME, ENV_KEY_STANDARD, ENV_KEY_STRONG, ENV_KID_STANDARD, ENV_KID_STRONG,
    KEY_LEN, NONCE_LEN,
};
use crate::atoms::error::{KernelError, KernelResult};
use crate::atoms::types::{EncryptStrength, RuleDecision};

// ═══════════════════════════════════════════════════════════════════════════
// Base64 helpers (URL-safe, padded — the wire format for all binary fields)
// ═══════════════════════════════════════════════════════════════════════════

fn b64e(bytes: &[u8]) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE, bytes)
}

fn b64d(s: &str) -> KernelResult<Vec<u8>> {
    base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE, s)
        .map_err(|_| KernelError::crypto("invalid base64 in envelope field"))
}

// ═══════════════════════════════════════════════════════════════════════════
// Envelope
// ═══════════════════════════════════════════════════════════════════════════

/// Self-describing encryption envelope. `ct` carries ciphertext plus the
/// GCM authentication tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub scheme: String,
    pub alg: String,
    pub kid: String,
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aad: Option<String>,
    pub ct: String,
}

impl Envelope {
    pub fn to_json(&self) -> KernelResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse an envelope from a stored value. Returns `None` when the
    /// value is not an envelope of the supported scheme — callers treat
    /// that as plaintext passthrough.
    pub fn from_json(s: &str) -> Option<Self> {
        let env: Envelope = serde_json::from_str(s).ok()?;
        if env.scheme != ENC_SCHEME {
            return None;
        }
        Some(env)
    }
}

/// Whether a stored value is an envelope of the supported scheme.
pub fn is_envelope(value: &str) -> bool {
    value.starts_with('{') && Envelope::from_json(value).is_some()
}

// ═══════════════════════════════════════════════════════════════════════════
// Canonical AAD
// ═══════════════════════════════════════════════════════════════════════════

/// Canonical AAD for a record value: `kind \0 key \0 ts`.
pub fn build_aad(kind: &str, key: &str, ts: &str) -> String {
    format!("{kind}\0{key}\0{ts}")
}

/// Canonical AAD for a record summary: the value AAD plus `\0 summary`.
/// Distinct binding keeps value and summary envelopes from being swapped
/// even though they share a key id.
pub fn build_summary_aad(kind: &str, key: &str, ts: &str) -> String {
    format!("{kind}\0{key}\0{ts}\0summary")
}

// ═══════════════════════════════════════════════════════════════════════════
// Key Provider
// ═══════════════════════════════════════════════════════════════════════════

/// Resolves 32-byte symmetric keys by strength tag or key id.
pub trait KeyProvider: Send + Sync {
    /// Key for a strength level; `None` strength is a caller bug and maps
    /// to standard.
    fn key_by_strength(&self, strength: EncryptStrength) -> (String, [u8; KEY_LEN]);

    /// Key for an envelope's `kid`, if this provider knows it.
    fn key_by_id(&self, kid: &str) -> Option<[u8; KEY_LEN]>;
}

/// Environment-backed key provider.
///
/// `BME_KEY_STANDARD` / `BME_KEY_STRONG` hold URL-safe base64 32-byte
/// keys; `BME_KID_STANDARD` / `BME_KID_STRONG` override the key ids
/// (defaults "std" / "str").
pub struct EnvKeyProvider {
    standard_kid: String,
    strong_kid: String,
    cache: HashMap<String, [u8; KEY_LEN]>,
}

impl EnvKeyProvider {
    pub fn new() -> Self {
        Self::with_kids(None, None)
    }

    /// Configuration may override the key ids; key bytes always come
    /// from the environment (or the ephemeral fallback).
    pub fn with_kids(standard_kid: Option<String>, strong_kid: Option<String>) -> Self {
        let standard_kid = standard_kid
            .or_else(|| std::env::var(ENV_KID_STANDARD).ok())
            .unwrap_or_else(|| "std".to_string());
        let strong_kid = strong_kid
            .or_else(|| std::env::var(ENV_KID_STRONG).ok())
            .unwrap_or_else(|| "str".to_string());

        let mut cache = HashMap::new();
        for (env_name, kid, label) in [
            (ENV_KEY_STANDARD, &standard_kid, "STANDARD"),
            (ENV_KEY_STRONG, &strong_kid, "STRONG"),
        ] {
            match std::env::var(env_name) {
                Ok(encoded) => match Self::decode_key(&encoded) {
                    Some(key) => {
                        cache.insert(kid.clone(), key);
                    }
                    None => {
                        error!(
                            "[encryption] Invalid {env_name}; must be URL-safe base64 of 32 bytes"
                        );
                    }
                },
                Err(_) => {}
            }

            if !cache.contains_key(kid) {
                let mut key = [0u8; KEY_LEN];
                rand::thread_rng().fill_bytes(&mut key);
                cache.insert(kid.clone(), key);
                warn!(
                    "[encryption] Using ephemeral dev key for {label}. \
                     Set {env_name} in production."
                );
            }
        }

        Self {
            standard_kid,
            strong_kid,
            cache,
        }
    }

    fn decode_key(encoded: &str) -> Option<[u8; KEY_LEN]> {
        let bytes = b64d(encoded).ok()?;
        <[u8; KEY_LEN]>::try_from(bytes.as_slice()).ok()
    }
}

impl Default for EnvKeyProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyProvider for EnvKeyProvider {
    fn key_by_strength(&self, strength: EncryptStrength) -> (String, [u8; KEY_LEN]) {
        let kid = match strength {
            EncryptStrength::Strong => &self.strong_kid,
            _ => &self.standard_kid,
        };
        (kid.clone(), self.cache[kid])
    }

    fn key_by_id(&self, kid: &str) -> Option<[u8; KEY_LEN]> {
        self.cache.get(kid).copied()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Encryption Engine
// ═══════════════════════════════════════════════════════════════════════════

/// Orchestrates envelope encryption according to rule policy.
pub struct EncryptionEngine {
    keys: Arc<dyn KeyProvider>,
}

impl EncryptionEngine {
    pub fn new(keys: Arc<dyn KeyProvider>) -> Self {
        Self { keys }
    }

    /// Encrypt plaintext under the key for `strength`, binding `aad`.
    pub fn encrypt(
        &self,
        plaintext: &str,
        strength: EncryptStrength,
        aad: &str,
    ) -> KernelResult<Envelope> {
        let (kid, key) = self.keys.key_by_strength(strength);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| KernelError::crypto("AES key must be 32 bytes"))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ct = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| KernelError::crypto(format!("AES-GCM encryption failed (kid={kid})")))?;

        Ok(Envelope {
            scheme: ENC_SCHEME.to_string(),
            alg: ALG_AES_GCM.to_string(),
            kid,
            nonce: b64e(&nonce_bytes),
            aad: Some(b64e(aad.as_bytes())),
            ct: b64e(&ct),
        })
    }

    /// Decrypt an envelope. Fails on unknown algorithm, unknown key id,
    /// or any tampering of nonce/aad/ciphertext.
    pub fn decrypt(&self, env: &Envelope) -> KernelResult<String> {
        if env.alg != ALG_AES_GCM {
            return Err(KernelError::crypto(format!(
                "unsupported algorithm: {}",
                env.alg
            )));
        }

        let key = self
            .keys
            .key_by_id(&env.kid)
            .ok_or_else(|| KernelError::crypto(format!("unknown key id: {}", env.kid)))?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| KernelError::crypto("AES key must be 32 bytes"))?;

        let nonce_bytes = b64d(&env.nonce)?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(KernelError::crypto("invalid nonce length"));
        }
        let aad = match &env.aad {
            Some(a) => b64d(a)?,
            None => Vec::new(),
        };
        let ct = b64d(&env.ct)?;

        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &ct,
                    aad: &aad,
                },
            )
            .map_err(|_| {
                KernelError::crypto(format!("authentication failed (kid={})", env.kid))
            })?;

        String::from_utf8(plaintext)
            .map_err(|_| KernelError::crypto("decrypted payload is not valid UTF-8"))
    }

    /// Encrypt plaintext if the decision demands it. Returns the
    /// serialized envelope, or `None` when no encryption applies.
    /// A demanded encryption that fails is an error — the pipeline must
    /// never silently fall back to plaintext.
    pub fn encrypt_for_policy(
        &self,
        plaintext: &str,
        decision: &RuleDecision,
        aad: &str,
    ) -> KernelResult<Option<String>> {
        match decision.encrypt {
            EncryptStrength::None => Ok(None),
            strength => {
                let env = self.encrypt(plaintext, strength, aad)?;
                Ok(Some(env.to_json()?))
            }
        }
    }

    /// Open a stored value: plaintext passes through, envelopes are
    /// decrypted. Any envelope failure is an error so callers can elide
    /// the record rather than expose ciphertext.
    pub fn open_value(&self, value: &str) -> KernelResult<String> {
        match Envelope::from_json(value) {
            None => Ok(value.to_string()),
            Some(env) => self.decrypt(&env),
        }
    }

    /// Best-effort variant of `open_value` for non-critical paths:
    /// failures are logged (without content) and the original value is
    /// returned unchanged.
    pub fn try_open_value(&self, value: &str) -> String {
        match Envelope::from_json(value) {
            None => value.to_string(),
            Some(env) => match self.decrypt(&env) {
                Ok(pt) => pt,
                Err(e) => {
                    error!("[encryption] Failed to decrypt envelope: {e}");
                    value.to_string()
                }
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
