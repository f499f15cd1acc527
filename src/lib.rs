pub mod error;
pub mod models;
pub mod modules;
pub mod scanner;

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};

use modules::persistence::Store;
use modules::system::{config, logger, validation};
use scanner::Scanner;

/// Builds the runtime, wires the pipeline, optionally auto-starts a
/// continuous scan, and waits for Ctrl+C.
pub fn run() {
    let app_config = match config::load_app_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    logger::init_logger(Path::new(&app_config.storage.data_path));

    if let Err(errors) = validation::validate_app_config(&app_config) {
        error!(
            "[E-CONFIG-INVALID] configuration_validation_failed:\n{}",
            errors.join("\n")
        );
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("[E-RUNTIME-INIT] failed_to_create_tokio_runtime: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        let store = match Store::open(&app_config.storage.database_path()) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!("[E-DB-INIT] failed_to_open_database: {}", e);
                std::process::exit(1);
            }
        };
        if let Err(e) = store.health_check() {
            error!("[E-DB-HEALTH] database_health_check_failed: {}", e);
            std::process::exit(1);
        }

        let scanner = match Scanner::new(app_config.clone(), Arc::clone(&store)) {
            Ok(scanner) => scanner,
            Err(e) => {
                error!("[E-SCANNER-INIT] failed_to_build_scanner: {}", e);
                std::process::exit(1);
            }
        };

        info!(
            "keysweep started: {} credential(s), query file '{}'",
            app_config.github.tokens.len(),
            app_config.scanner.query_file
        );

        let scan_handle = if app_config.scanner.auto_start {
            let scanner = Arc::clone(&scanner);
            Some(tokio::spawn(async move {
                if let Err(e) = scanner.run_continuous().await {
                    error!("[E-SCAN-LOOP] continuous_scan_failed: {}", e);
                }
            }))
        } else {
            info!("Auto-start disabled; waiting for an external start signal");
            None
        };

        info!("Service is running. Press Ctrl+C to exit.");
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");

        scanner.stop();
        if let Some(handle) = scan_handle {
            match tokio::time::timeout(std::time::Duration::from_secs(10), handle).await {
                Ok(_) => info!("Scan loop stopped cleanly"),
                Err(_) => warn!("[W-SHUTDOWN-TIMEOUT] scan_loop_did_not_stop_within_10s"),
            }
        }
    });
}
