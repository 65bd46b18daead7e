pub mod capabilities;
pub mod fallback;
pub mod ladder;
pub mod prompt;
pub mod reveal;
pub mod thresholds;

pub use fallback::{execute_with_fallback, EndpointError, ExecutionResult};
pub use ladder::{ModelLadders, OperationKind};
pub use reveal::{RetryPolicy, RevealEngine, RevealMode, RevealOptions, RevealResult, RevealSettings};
