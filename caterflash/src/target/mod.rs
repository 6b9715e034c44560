//! Target devices.

pub mod caterina;
pub mod profile;

pub use caterina::{CaterinaFlasher, SessionConfig};
pub use profile::DeviceProfile;
