mod seq32;
mod time;

pub use seq32::*;
pub use time::*;
