pub mod binner;
pub mod clock;
pub mod control_loop;
pub mod decoders;
pub mod triggers;
