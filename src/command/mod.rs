//! Command channel to the drone.
//!
//! [`CommandTransport`] owns the command socket and serializes callers;
//! [`DroneCommand`] builds validated command text; [`Reply`] is what a
//! successful call resolves to.

mod device;
mod reply;
mod transport;

pub use device::{Direction, DroneCommand, Flip, Rotation};
pub use reply::Reply;
pub use transport::CommandTransport;
