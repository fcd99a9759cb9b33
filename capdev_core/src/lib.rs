pub mod bootstrap;
pub mod capbac;
pub mod coap;
pub mod config;
pub mod gate;
pub mod observe;
pub mod resource;
pub mod server;
pub mod token;
pub mod validator;

pub use bootstrap::{BootstrapError, Bootstrapper};
pub use capbac::{CapbacCli, CapbacError};
pub use config::{load_config, ServerConfig};
pub use gate::{AuthorizationGate, Framing, RejectReason, Rejected};
pub use observe::{ObservationEvent, ObservationScheduler};
pub use resource::{Request, Resource, Response, SimpleResource, Site, TimeResource};
pub use server::{Client, ResourceServer};
pub use token::{AccessRule, Action, CapabilityToken, Envelope, ValidationRequest, ValidationResult};
pub use validator::{TokenValidator, ValidatorError, ValidatorHandle, ValidatorWorker};
