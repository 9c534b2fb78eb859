pub mod preintegration;
pub mod sample;
pub mod types;

pub use preintegration::{NavState, Preintegrated};
pub use sample::{validate_batch, ImuSample, GRAVITY, GRAVITY_MAGNITUDE};
pub use types::{ImuBias, ImuCalib};

/// Inertial initialization progress of a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum InertialStage {
    #[default]
    Uninitialized,
    Initialized,
    FirstRefinement,
    SecondRefinement,
}

impl InertialStage {
    pub fn is_initialized(self) -> bool {
        self >= InertialStage::Initialized
    }
}
