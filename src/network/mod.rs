pub mod client;
pub mod server;

pub use client::send_or_skip;
pub use server::{bind, serve};
