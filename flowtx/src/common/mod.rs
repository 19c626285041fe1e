mod constants;
mod event_bus;
mod type_utils;
mod worker;

pub use constants::*;
pub use event_bus::*;
pub use type_utils::*;
pub use worker::*;
