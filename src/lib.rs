pub mod archive;
pub mod aws;
pub mod cancel;
pub mod cleanup;
pub mod commands;
pub mod error;
pub mod http;
pub mod install;
pub mod manifest;
pub mod pipeline;
pub mod publish;
pub mod router;
pub mod runtime;
pub mod state;
