// ── Kernel Atoms ────────────────────────────────────────────────────────────
// Pure data types, the canonical error enum, and shared constants.
// No I/O, no DB access, no engine logic.

pub mod constants;
pub mod error;
pub mod types;
