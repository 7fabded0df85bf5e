pub mod intake;
pub mod metrics;
pub mod sandbox;
