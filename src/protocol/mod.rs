mod segment_hdr;

pub use segment_hdr::*;
