//! Errors that can stop the server from starting or keep running.
//!
//! Socket and file failures arrive as `Io`. A bad config file is `Toml` when it cannot be parsed
//! and `Config` when a value is out of range, while `Serialize` covers writing the user table
//! back out. `Logger` means a logger was already installed. `Poisoned` is a lock whose holder
//! panicked, in the worker pool or the user table. `Shutdown` is a pool that no longer takes jobs.
//!
//! Errors on a single connection never get this far. They are logged by the worker and the
//! connection is closed.

use std::io;
use std::result;
use std::sync::PoisonError;

use log;

use toml;

quick_error! {
    #[derive(Debug)]
    pub enum Error {
        Io(err: io::Error) {
            display("IO error: {}", err)
            cause(err)
            from()
        }
        Toml(err: toml::de::Error) {
            display("Config file error: {}", err)
            cause(err)
            from()
        }
        Serialize(err: toml::ser::Error) {
            display("Could not serialize: {}", err)
            cause(err)
            from()
        }
        Logger(err: log::SetLoggerError) {
            display("Could not install logger: {}", err)
            cause(err)
            from()
        }
        Config(reason: String) {
            display("Invalid config: {}", reason)
        }
        Poisoned {
            display("A lock was poisoned by a panicking thread")
        }
        Shutdown {
            display("The worker pool has shut down")
        }
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::Poisoned
    }
}

pub type Result<T> = result::Result<T, Error>;

#[macro_export]
macro_rules! throw {
    ($result:expr) =>  {
        match $result {
            Ok(t) => t,
            Err(e) => {
                let e: $crate::Error = e.into();
                warn!("{}", e);
                return Err(e);
            },
        }
    }
}
