//! Conversation context management.
//!
//! ```text
//! ChatSession
//! ├── window: ConversationWindow (messages or compacted items + continuation)
//! ├── registry lookup: ModelRegistry (context window per model)
//! └── compactor: ContextCompactor (server-side compaction above 90%)
//! ```

mod compactor;
mod model_limits;
mod session;

pub use compactor::{CompactionOutcome, ContextCompactor};
pub use model_limits::{
    DEFAULT_LIMITS, ModelLimits, ModelLimitsSource, ModelRegistry, ResolvedModelLimits,
};
pub use session::{ChatSession, TurnSummary};
