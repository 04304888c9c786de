pub mod client;
pub mod engine;
pub mod requests;

pub use client::Client;
pub use engine::CloudflareEngine;
