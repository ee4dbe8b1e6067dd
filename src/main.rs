#[macro_use]
extern crate log;

#[macro_use]
extern crate webserver;

use std::env;
use std::process;
use std::sync::Arc;

use webserver::credentials::UserTable;
use webserver::{logger, Config, Server};

fn main() {
    let path = env::args().nth(1).unwrap_or_else(|| "./config.toml".to_owned());
    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Could not load {}: {}", path, e);
            process::exit(1);
        }
    };

    if let Err(e) = logger::init(&config.log) {
        eprintln!("Could not start logging: {}", e);
        process::exit(1);
    }
    info!("Loaded config from {}", path);

    let users = Arc::new(unwrap!(UserTable::open(&config.credentials)));
    let mut server = unwrap!(Server::new(Arc::new(config), users));
    unwrap!(server.run());
    log::logger().flush();
}
