pub mod credential_store;
pub mod drive_client;
pub mod job_artifacts;
pub mod job_registry;
pub mod tabular;
pub mod verifier;
