pub mod api;
pub mod config;
pub mod jobs;
pub mod shutdown;
pub mod worker;
