pub mod config;
pub mod types;

pub use types::{LaunchMetadata, LaunchPayload, PayloadError, RunKey, SecretRef, WebhookBase};
