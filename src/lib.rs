// ── Bartholomew Kernel ──────────────────────────────────────────────────────
//
// Privacy-first local memory kernel for a long-running personal AI companion.
//
// Ingestion runs a rule-driven governance pipeline (classification →
// redaction → summarization → embedding → encryption → persistence →
// indexing) over a single SQLite file. Retrieval fuses FTS5 and vector
// candidates behind a consent gate that enforces privacy at the lowest
// level. A scoped fail-closed parking brake gates the write and retrieval
// paths.
//
// Layout follows the atoms/engine split: pure data types live in `atoms/`,
// the engines and stores in `kernel/`.

pub mod atoms;
pub mod kernel;

// Re-exports for the public surface
pub use atoms::error::{KernelError, KernelResult};
pub use atoms::types::{
    BrakeScope, BrakeState, EmbedMode, EmbedSource, EncryptStrength, FtsIndexMode, FusionMode,
    KernelConfig, MemoryRecord, RecallPolicy, RecordDraft, RetrievalFilters, RetrievalMode,
    RetrievedItem, RuleDecision, RuleSet, SummaryMode, UpsertOutcome,
};
pub use kernel::brake::ParkingBrake;
pub use kernel::config::{load_config, RulesHandle};
pub use kernel::consent::ConsentGate;
pub use kernel::embedding::{EmbeddingEngine, EmbeddingProvider, HashEmbedderProvider};
pub use kernel::encryption::{EncryptionEngine, EnvKeyProvider, Envelope, KeyProvider};
pub use kernel::retrieval::{HybridRetriever, RetrieveOptions};
pub use kernel::rules::RulesEngine;
pub use kernel::store::{Kernel, MemoryStore};
