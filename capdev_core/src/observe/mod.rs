//! Observation support: the per-resource notification scheduler and the
//! transport's observer bookkeeping.

mod registry;
mod scheduler;

pub use registry::{ObserverKey, ObserverRegistry};
pub use scheduler::{
    ObservationEvent, ObservationPhase, ObservationScheduler, ScheduleStats,
    DEFAULT_OBSERVE_INTERVAL,
};
