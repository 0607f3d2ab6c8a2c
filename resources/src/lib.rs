pub mod anomaly;
pub mod config;
pub mod learning;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod objects;
pub mod profiles;
pub mod workload;
