#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;
extern crate snafu;

pub mod accel;
pub mod bdev;
pub mod core;
pub mod logger;
pub mod sock;
