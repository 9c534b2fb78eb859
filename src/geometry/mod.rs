//! Geometry: rigid and similarity transforms, the camera model and the
//! minimal solvers used by tracking and loop closing.

pub mod camera;
pub mod pnp;
pub mod rustcv;
pub mod se3;
pub mod sim3;
pub mod so3;
pub mod triangulation;
pub mod two_view;

pub use camera::CameraModel;
pub use se3::SE3;
pub use sim3::Sim3;
