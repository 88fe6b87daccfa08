use std::sync::Arc;

use duskdhcp::v6::handlers::Server6;
use duskdhcp::{logging, signal, v6, Config, MemfileLeaseDb, ServerIdFile};

fn main() {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.json".into());
    let config = match Config::load_from_file(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    logging::init_stdout(config.log_level);

    let duid_path =
        std::env::var("DUSKDHCP6_DUID_FILE").unwrap_or_else(|_| "server-duid.txt".into());
    let server_id = match ServerIdFile::new(duid_path).ensure() {
        Ok(duid) => duid,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    let shared = config.shared();
    signal::spawn_sighup_handler(Arc::clone(&shared), config_path.into());

    let srv = Server6::new(Arc::new(MemfileLeaseDb::new()), server_id);
    v6::v6_worker(&srv, &shared);
}
