//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod bitmap;
mod error;
mod safetcp;

pub use bitmap::{quorum_size, Bitmap};
pub use error::TripStoreError;
pub use print::logger_init;

pub use safetcp::{
    read_frame, tcp_bind_with_retry, tcp_connect_with_retry, write_frame,
};
