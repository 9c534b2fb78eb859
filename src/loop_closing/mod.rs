//! Loop Closing and map merging.
//!
//! Place recognition over the KeyFrame database finds revisits of the
//! active map (loops) and of inactive maps (merges). Candidates are verified
//! geometrically with a Sim3 and then either close the loop through an
//! essential graph optimization or merge the two maps. Both end by
//! launching a global BA in the background.
//!
//! # Threading Model
//!
//! The LoopCloser runs in its own thread, receiving keyframes from
//! LocalMapping via a channel. Verification works on a snapshot taken
//! under the Atlas read lock; corrections pause Local Mapping and take the
//! optimization gate for write before the Atlas write lock.

pub mod corrector;
pub mod detector;
mod loop_closer;
pub mod merger;
pub mod sim3_solver;
pub mod verification;

pub use corrector::{correct_loop, CorrectionParams, CorrectionReport};
pub use detector::{ConsistencyChecker, Detection, PlaceDetector};
pub use loop_closer::{run_global_ba, LoopCloser, LoopCloserStats, LoopOutcome};
pub use merger::{merge_maps, MergeParams, MergeReport};
pub use sim3_solver::{RansacParams, Sim3Estimate, Sim3Solver};
pub use verification::{verify, PlaceSnapshot, VerificationParams, VerifiedPlace};
