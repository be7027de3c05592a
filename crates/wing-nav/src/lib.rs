pub mod doctor;
pub mod energy;
pub mod geo;
pub mod geofence;
pub mod geolocate;
pub mod link;

pub use energy::{EnergyBudgetEngine, EnergyConfig, EnergyEstimate, EnergyResponse, EnergyTier};
pub use geofence::{FenceAction, FenceCheck, GeoFence, GeofenceConfig, GeofenceEngine};
pub use geolocate::CameraModel;
pub use link::{LinkConfig, LinkHealth, LinkHealthMonitor};
