pub mod delta;
pub mod plan;
pub mod scan;
pub mod status;
