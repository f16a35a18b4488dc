//! Diagnostics command - prints resolved configuration and checks the
//! daemon's environment

use anyhow::Result;

use novapm::database::{Database, ProcessRepository};

/// Run environment diagnostics
pub async fn run(config_path: Option<&str>) -> Result<()> {
    let config = super::root::load_config(config_path)?;

    println!("novapm v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Paths:");
    println!("  root:      {}", config.system.root_directory.display());
    println!("  logs:      {}", config.system.log_directory().display());
    println!("  database:  {}", config.system.database_path().display());
    println!("  socket:    {}", config.system.socket_path().display());
    println!("  plugins:   {}", config.system.plugin_directory().display());
    println!();
    println!("Settings:");
    println!("  metrics interval: {}ms", config.metrics.interval_ms);
    println!(
        "  log rotation:     {} bytes, keep {}, compress {}",
        config.logs.max_size_bytes(),
        config.logs.keep,
        config.logs.compress
    );

    print!("Database: ");
    match Database::open(config.system.database_path()) {
        Ok(db) => {
            let count = db.all_processes().await.map(|rows| rows.len()).unwrap_or(0);
            println!("ok ({} definitions)", count);
        }
        Err(e) => println!("FAILED ({})", e),
    }

    print!("IPC socket: ");
    let socket = config.system.socket_path();
    if socket.exists() {
        match novapm::ipc::IpcClient::connect(&socket).await {
            Ok(mut client) => match client.daemon_status().await {
                Ok(status) => println!(
                    "live (daemon v{}, {} processes, up {}s)",
                    status["version"].as_str().unwrap_or("?"),
                    status["processes"]["total"],
                    status["uptimeSecs"]
                ),
                Err(e) => println!("present but unresponsive ({})", e),
            },
            Err(e) => println!("present but not accepting connections ({})", e),
        }
    } else {
        println!("absent");
    }

    Ok(())
}
