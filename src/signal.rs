use std::path::PathBuf;
use std::sync::Arc;

use signal_hook::consts::SIGHUP;
use signal_hook::iterator::Signals;
use tracing::{error, info};

use crate::config::{Config, SharedConfig};

/// Spawn a thread that handles SIGHUP by re-reading the configuration
/// file and swapping the shared pointer. In-flight requests keep the
/// snapshot they loaded; the next request sees the new subnets.
pub fn spawn_sighup_handler(
    config: SharedConfig,
    config_path: PathBuf,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("sighup".to_string())
        .spawn(move || {
            let mut signals =
                Signals::new([SIGHUP]).expect("Failed to register SIGHUP handler");

            for sig in signals.forever() {
                if sig == SIGHUP {
                    info!("received SIGHUP, reloading configuration");
                    match Config::load_from_file(&config_path) {
                        Ok(fresh) => {
                            let subnets = fresh.subnets().len();
                            config.store(Arc::new(fresh));
                            info!(subnets, "reloaded configuration");
                        }
                        Err(e) => error!(%e, "failed to reload configuration"),
                    }
                }
            }
        })
        .expect("Failed to spawn SIGHUP handler thread")
}
