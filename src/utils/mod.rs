//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod bitmap;
mod deadline;
mod safetcp;

pub use bitmap::Bitmap;
pub use deadline::Deadline;
pub use error::SquallError;

pub(crate) use safetcp::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry,
    tcp_connect_with_retry,
};
