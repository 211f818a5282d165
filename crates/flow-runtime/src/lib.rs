// Flow Runtime - reply validation, node walking, internal node
// evaluation, the per-user orchestrator, delay scheduling and
// transaction recording.

pub mod channel_dispatch;
pub mod delay_scheduler;
pub mod internal_node;
pub mod node_walker;
pub mod orchestrator;
pub mod reply_validator;
pub mod transaction;

pub use channel_dispatch::{ChannelDispatcher, HttpChannelDispatcher, ProcessNodeRequest};
pub use delay_scheduler::DelayScheduler;
pub use internal_node::{process_internal_node, InternalOutcome};
pub use node_walker::{NodeWalker, WalkRequest, WalkResult, WalkStatus};
pub use orchestrator::{Orchestrator, OrchestrationResult};
pub use reply_validator::{Outcome, ReplyValidator};
pub use transaction::TransactionRecorder;
