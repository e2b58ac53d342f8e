pub mod api;
pub mod auth;
pub mod backoff;
pub mod cleanup_job;
pub mod cloud_init;
pub mod provisioning_job;
pub mod schedule;
pub mod scheduler;
pub mod settings;
pub mod shutdown;
pub mod wait;
