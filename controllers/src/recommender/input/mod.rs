pub mod feeder;
pub mod metrics;
pub mod oom;
pub mod spec;
