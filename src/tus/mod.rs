mod client;
mod constants;
mod metadata;

pub use client::TusClient;
pub use metadata::Metadata;
