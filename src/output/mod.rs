pub mod laser;
pub mod protocol;
pub mod transport;

pub use laser::{ActuatorLink, ActuatorState};
pub use protocol::{ActuatorCommand, DeactivateCode};
pub use transport::{open_configured, MemoryTransport, SerialTransport, Transport};
