use rocket::fairing::{Fairing, Info, Kind};
use rocket::{Orbit, Rocket};
use std::sync::Arc;

use crate::notify::Notifier;

/// Starts the notification queue workers once Rocket is serving, and stops
/// them on shutdown.
pub struct QueueWorkers;

#[rocket::async_trait]
impl Fairing for QueueWorkers {
    fn info(&self) -> Info {
        Info {
            name: "Notification Queue Workers",
            kind: Kind::Liftoff | Kind::Shutdown,
        }
    }

    async fn on_liftoff(&self, rocket: &Rocket<Orbit>) {
        match rocket.state::<Arc<Notifier>>() {
            Some(notifier) => {
                notifier.start();
                log::info!("[task] Notification workers started");
            }
            None => log::error!("[task] Notifier not found in managed state, workers not started"),
        }
    }

    async fn on_shutdown(&self, rocket: &Rocket<Orbit>) {
        if let Some(notifier) = rocket.state::<Arc<Notifier>>() {
            notifier.stop();
            log::info!("[task] Notification workers stopped");
        }
    }
}
