// ── Kernel Atoms: Constants ─────────────────────────────────────────────────

/// Versioned envelope scheme identifier. Readers reject anything else.
pub const ENC_SCHEME: &str = "bartholomew.enc.v1";

/// The only supported AEAD algorithm.
pub const ALG_AES_GCM: &str = "AES-GCM";

/// AES-GCM nonce size in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Symmetric key size in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// Content shorter than this is never auto-summarized.
pub const SUMMARY_LENGTH_THRESHOLD: usize = 1000;

/// Target length for extractive summaries, in characters.
pub const SUMMARY_TARGET_LENGTH: usize = 900;

/// Default embedding dimension (MiniLM/BGE-small class models).
pub const DEFAULT_EMBED_DIM: usize = 384;

/// Default recency shaping half-life, in hours (one week).
pub const DEFAULT_RECENCY_HALF_LIFE_HOURS: f64 = 168.0;

/// Default RRF denominator constant (standard in IR literature).
pub const DEFAULT_RRF_K: u32 = 60;

/// Candidate over-fetch multiplier applied before the consent gate trims.
pub const GATE_OVERFETCH: usize = 3;

/// Memory kind used for the parking-brake audit trail. The default rule
/// set must allow this kind to be stored un-redacted.
pub const SAFETY_AUDIT_KIND: &str = "safety.audit";

/// `system_flags` key holding the persisted brake state.
pub const BRAKE_FLAG_KEY: &str = "parking_brake";

/// Master switch for the embedding hook ("1" enables, "0" disables).
pub const ENV_EMBED_ENABLED: &str = "BARTHO_EMBED_ENABLED";

/// Set to "0" to disable the config watcher (tests/CI).
pub const ENV_EMBED_RELOAD: &str = "BARTHO_EMBED_RELOAD";

/// URL-safe base64 encoded 32-byte standard-strength key.
pub const ENV_KEY_STANDARD: &str = "BME_KEY_STANDARD";

/// URL-safe base64 encoded 32-byte strong-strength key.
pub const ENV_KEY_STRONG: &str = "BME_KEY_STRONG";

/// Optional key-id override for the standard key (default "std").
pub const ENV_KID_STANDARD: &str = "BME_KID_STANDARD";

/// Optional key-id override for the strong key (default "str").
pub const ENV_KID_STRONG: &str = "BME_KID_STRONG";
