#[macro_use]
extern crate rocket;

use std::sync::Arc;

mod config;
mod db;
mod email;
mod health;
mod notify;
mod queue;
mod store;
mod tasks;

#[cfg(test)]
mod tests;

use config::AppConfig;
use health::BackendName;
use notify::Notifier;
use store::Backend;

#[launch]
fn rocket() -> _ {
    env_logger::init();

    let config = match AppConfig::load() {
        Ok(c) => c,
        Err(e) => {
            log::error!("[boot] {}", e);
            std::process::exit(1);
        }
    };

    let backend = match Backend::connect(&config.database) {
        Ok(b) => b,
        Err(e) => {
            log::error!("[boot] Failed to open {} backend: {}", config.database.backend, e);
            std::process::exit(1);
        }
    };
    log::info!("[boot] Job store backend: {}", backend.name());

    let notifier = match Notifier::new(&config, &backend) {
        Ok(n) => Arc::new(n),
        Err(e) => {
            log::error!("[boot] Failed to set up notification queues: {}", e);
            std::process::exit(1);
        }
    };

    rocket::build()
        .manage(notifier)
        .manage(BackendName(backend.name()))
        .attach(tasks::QueueWorkers)
        .mount("/", health::routes())
}
