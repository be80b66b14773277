pub mod errors;
pub mod frame;
pub mod ids;
pub mod status;

pub use errors::DeliveryError;
pub use frame::{StatusBody, StatusFrame};
pub use status::TaskStatus;
