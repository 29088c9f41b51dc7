pub mod latch;

pub use latch::{Latch, LatchCommand, LatchState};
