/// Unwraps a startup result, logging the error and exiting the process when it fails.
#[macro_export]
macro_rules! unwrap {
    ($result:expr) => {
        match $result {
            Ok(t) => t,
            Err(e) => {
                error!("Aborting due to {}", e);
                ::std::process::exit(1)
            }
        }
    }
}
