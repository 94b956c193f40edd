use sortie_plan::MissionPlan;
use tokio::sync::watch;

use crate::action::ActionError;
use crate::mission::MissionError;
use crate::telemetry::Telemetry;

/// High-level vehicle control used by the flight procedures.
///
/// Every call returns once the autopilot has acknowledged it; completion of the
/// manoeuvre itself is observed through [`Autopilot::telemetry`].
#[allow(async_fn_in_trait)]
pub trait Autopilot {
    async fn arm(&self) -> Result<(), ActionError>;

    async fn set_takeoff_altitude(&self, alt_m: f32) -> Result<(), ActionError>;

    async fn takeoff(&self) -> Result<(), ActionError>;

    async fn land(&self) -> Result<(), ActionError>;

    async fn return_to_launch(&self) -> Result<(), ActionError>;

    /// Applies to the next [`Autopilot::upload_mission`].
    fn set_return_to_launch_after_mission(&self, enable: bool);

    async fn upload_mission(&self, plan: &MissionPlan) -> Result<(), MissionError>;

    async fn start_mission(&self) -> Result<(), MissionError>;

    /// Switch to offboard control. Setpoints must already be streaming.
    async fn start_offboard(&self) -> Result<(), ActionError>;

    /// Fire-and-forget local NED position setpoint.
    fn set_position_ned(&self, north_m: f32, east_m: f32, down_m: f32) -> Result<(), ActionError>;

    fn telemetry(&self) -> watch::Receiver<Telemetry>;
}
