//! `trellis-server`: process entry points and client front-ends.

pub mod args_parse;
pub mod http;
pub mod operations;
pub mod server;
pub mod service_configuration;
pub mod socket;

pub use server::run;
