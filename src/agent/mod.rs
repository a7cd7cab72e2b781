pub mod cognitive;
pub mod compaction;
#[path = "loop/mod.rs"]
pub mod agent_loop;
pub mod memory;
pub mod meta;
pub mod task;

pub use agent_loop::{CompletionReason, TaskEvent, TaskHandle, TaskRunner};
pub use cognitive::{CheckpointAnalyzer, CognitionContext, CognitionOutcome, CognitiveAnalyzer};
pub use memory::{KeywordTagger, MemoryTagger, TaggingResult};
pub use task::{TaskSnapshot, TaskState};
