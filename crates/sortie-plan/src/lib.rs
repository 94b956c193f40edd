//! Mission plans and pre-flight checks shared by the flight procedures.

pub mod doctor;
pub mod geo;
pub mod offboard;
pub mod plan;

pub use offboard::{LocalPoint, OffboardCfg};
pub use plan::{CameraAction, MissionCfg, MissionItem, MissionPlan};
