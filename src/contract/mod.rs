//! Contract interaction layer
//!
//! Splits on-chain work into calldata encoding, the pre-submission
//! sanitation check, the tiered submission pipeline, and the logical
//! operations the state machine calls.

pub mod encode;
pub mod operations;
pub mod pipeline;
pub mod sanitation;

pub use operations::ContractOperations;
pub use pipeline::{
    RelayedTerms, Submission, SubmissionOutcome, SubmissionPipeline, SubmissionTier, WaitEvent,
};
