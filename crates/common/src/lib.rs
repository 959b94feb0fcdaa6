// syncwire-common: wire protocol and shared types for the Syncwire workspace

pub mod protocol;
pub mod types;
