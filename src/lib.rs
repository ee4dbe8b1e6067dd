#[macro_use]
extern crate log;

extern crate simple_logger;

extern crate serde;

#[macro_use]
extern crate serde_derive;

extern crate toml;

extern crate mio;

extern crate iovec;

extern crate slab;

#[macro_use]
extern crate quick_error;

extern crate bcrypt;

extern crate libc;

extern crate chrono;

#[macro_use]
mod result;
#[macro_use]
mod error;
pub use error::{Error, Result};

mod config;
pub use config::{Config, CredentialConfig, LogConfig, TimerKind, TriggerMode};

pub mod buffer;
pub mod credentials;
pub mod http;
pub mod logger;
pub mod pool;
pub mod timer;

mod connection;

mod server;
pub use server::{Server, Shutdown};

#[cfg(test)]
mod testing;
