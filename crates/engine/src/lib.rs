//! The agent turn engine and its gates.
//!
//! One turn: load history → call the model with the aggregated tool
//! catalog → emit approval prompts one at a time → execute approved
//! calls concurrently → feed results back to the model → repeat, bounded.
//! The optional dispatch plane decouples execution into a worker pool
//! fed by the state store's job queue.

pub mod approval;
pub mod cancel;
pub mod dispatch;
pub mod executor;
pub mod limiter;
pub mod turn;

pub use approval::ApprovalGate;
pub use cancel::{CancelMap, CancelToken};
pub use dispatch::{JobDispatcher, ToolJob, ToolJobResult, WorkerPool};
pub use executor::ToolExecutor;
pub use limiter::BackpressureLimiter;
pub use turn::{TurnEngine, TurnEngineBuilder};
