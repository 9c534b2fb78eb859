//! Staged inertial initialization for visual-inertial maps.
//!
//! A map goes through three inertial-only optimizations as it ages:
//! - Initialized: gravity direction, scale (monocular), biases and velocities
//!   from a few seconds of KeyFrames, with tight bias priors
//! - FirstRefinement / SecondRefinement: the same problem over a longer
//!   window with the priors relaxed
//!
//! Each run follows the collect / solve / apply split. The solution is
//! dropped when a reset happened or the map changed identity meanwhile.

use tracing::{info, warn};

use crate::config::SlamConfig;
use crate::imu::{ImuCalib, InertialStage};
use crate::optimizer::inertial_init::{self, BiasPriors, InertialInitProblem};
use crate::system::shared_state::SharedState;

#[derive(Debug, Clone)]
pub struct InertialScheduler {
    calib: ImuCalib,
    monocular: bool,
    init_time: f64,
    first_refinement_time: f64,
    second_refinement_time: f64,
    min_keyframes: usize,
}

impl InertialScheduler {
    /// `None` for purely visual sensors.
    pub fn new(config: &SlamConfig) -> Option<Self> {
        if !config.sensor.is_inertial() {
            return None;
        }
        let monocular = config.sensor.is_monocular();
        Some(Self {
            calib: ImuCalib::from_config(&config.imu),
            monocular,
            init_time: if monocular {
                config.imu.init_time_mono
            } else {
                config.imu.init_time_stereo
            },
            first_refinement_time: config.imu.first_refinement_time,
            second_refinement_time: config.imu.second_refinement_time,
            min_keyframes: config.imu.min_keyframes_for_init,
        })
    }

    /// Stage a map of this age and size is ready for, if it is past its current one.
    pub fn next_stage(&self, current: InertialStage, age: f64, keyframes: usize) -> Option<InertialStage> {
        match current {
            InertialStage::Uninitialized if age >= self.init_time && keyframes >= self.min_keyframes => {
                Some(InertialStage::Initialized)
            }
            InertialStage::Initialized if age >= self.first_refinement_time => Some(InertialStage::FirstRefinement),
            InertialStage::FirstRefinement if age >= self.second_refinement_time => {
                Some(InertialStage::SecondRefinement)
            }
            _ => None,
        }
    }

    /// Bias priors for a stage; later stages trust the data more.
    pub fn priors(&self, stage: InertialStage) -> BiasPriors {
        match stage {
            InertialStage::Uninitialized | InertialStage::Initialized => BiasPriors {
                gyro: 1e2,
                accel: if self.monocular { 1e10 } else { 1e5 },
            },
            InertialStage::FirstRefinement => BiasPriors { gyro: 1.0, accel: 1e5 },
            InertialStage::SecondRefinement => BiasPriors { gyro: 0.0, accel: 0.0 },
        }
    }

    /// Run the next due stage on the active map. Returns the stage reached.
    pub fn step(&self, shared: &SharedState, generation: u64) -> Option<InertialStage> {
        let (map_id, stage, problem) = {
            let atlas = shared.atlas.read();
            let map = atlas.active_map();
            let stage = self.next_stage(map.inertial_stage(), map.age(), map.num_keyframes())?;
            let problem = InertialInitProblem::collect(map, &self.calib, self.priors(stage), !self.monocular)?;
            (map.id(), stage, problem)
        };
        if shared.is_stale(generation) {
            return None;
        }

        let result = match inertial_init::solve(&problem) {
            Ok(result) => result,
            Err(e) => {
                warn!("[LocalMapping] Inertial {:?} discarded: {}", stage, e);
                return None;
            }
        };

        let _gate = shared.optimization_gate.read();
        let mut atlas = shared.atlas.write();
        if shared.is_stale(generation) || atlas.active_map_id() != map_id {
            return None;
        }
        let map = atlas.active_map_mut();
        inertial_init::apply(map, &result);
        map.set_inertial_stage(stage);
        shared.set_map_changed();
        info!(
            "[LocalMapping] {} inertial stage {:?}: scale {:.3}, {} keyframes",
            map_id,
            stage,
            result.scale,
            problem.keyframes.len()
        );
        Some(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorMode;

    fn scheduler(sensor: SensorMode) -> Option<InertialScheduler> {
        let config = SlamConfig {
            sensor,
            ..SlamConfig::default()
        };
        InertialScheduler::new(&config)
    }

    #[test]
    fn test_visual_sensors_have_no_schedule() {
        assert!(scheduler(SensorMode::Stereo).is_none());
        assert!(scheduler(SensorMode::Monocular).is_none());
    }

    #[test]
    fn test_stages_follow_map_age() {
        let s = scheduler(SensorMode::ImuStereo).unwrap();
        assert_eq!(s.next_stage(InertialStage::Uninitialized, 0.5, 20), None);
        assert_eq!(s.next_stage(InertialStage::Uninitialized, 1.2, 5), None);
        assert_eq!(
            s.next_stage(InertialStage::Uninitialized, 1.2, 12),
            Some(InertialStage::Initialized)
        );
        assert_eq!(s.next_stage(InertialStage::Initialized, 3.0, 12), None);
        assert_eq!(
            s.next_stage(InertialStage::Initialized, 5.5, 12),
            Some(InertialStage::FirstRefinement)
        );
        assert_eq!(
            s.next_stage(InertialStage::FirstRefinement, 16.0, 12),
            Some(InertialStage::SecondRefinement)
        );
        assert_eq!(s.next_stage(InertialStage::SecondRefinement, 100.0, 12), None);

        let mono = scheduler(SensorMode::ImuMonocular).unwrap();
        assert_eq!(mono.next_stage(InertialStage::Uninitialized, 1.5, 12), None);
        assert_eq!(
            mono.next_stage(InertialStage::Uninitialized, 2.0, 12),
            Some(InertialStage::Initialized)
        );
    }

    #[test]
    fn test_priors_relax() {
        let s = scheduler(SensorMode::ImuMonocular).unwrap();
        let first = s.priors(InertialStage::Initialized);
        let last = s.priors(InertialStage::SecondRefinement);
        assert!(first.gyro > last.gyro);
        assert!(first.accel > last.accel);
    }
}
