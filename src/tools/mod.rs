pub mod descriptor;
pub mod executor;
pub mod http;
pub mod location;
pub mod registry;
pub mod video_search;
pub mod weather;
pub mod web_search;

pub use descriptor::{is_blank, CapabilityDescriptor, FieldSpec, FieldType, ValueKind};
pub use executor::{AuditOutcome, CapabilityExecutor};
pub use location::{DistanceCapability, Geocoder, LocationSearchCapability};
pub use registry::{Capability, CapabilityRegistry};
pub use video_search::VideoSearchCapability;
pub use weather::WeatherCapability;
pub use web_search::WebSearchCapability;
