pub mod checkpoint_manager;
pub mod compression_coordinator;
pub mod context_manager;
pub mod events;
pub mod preprocessing;
pub mod templates;
pub mod token_counter;
pub mod vram_monitor;

pub use checkpoint_manager::CheckpointManager;
pub use compression_coordinator::{CompressionCoordinator, CompressionCoordinatorConfig, CompressionOutcome};
pub use context_manager::ContextManager;
pub use events::EventBus;
pub use preprocessing::{PreprocessConfig, PreprocessOutcome, Preprocessor};
pub use templates::build_system_prompt;
pub use token_counter::TokenCounter;
pub use vram_monitor::{select_auto_sized_context, VramInfo, VramMonitor};
