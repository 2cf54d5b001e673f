pub mod events;
pub mod metrics;

pub use metrics::Registry;
