// ABOUTME: Standardized paths for config and data storage
// ABOUTME: Uses ~/.config/spool for config and ~/.local/share/spool for data and logs

use directories::BaseDirs;
use std::path::PathBuf;

fn home_dir() -> PathBuf {
    BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get the config directory path: ~/.config/spool/
pub fn config_dir() -> PathBuf {
    home_dir().join(".config").join("spool")
}

/// Get the default config file path: ~/.config/spool/config.toml
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Get the data directory path: ~/.local/share/spool/
/// Falls back to ./data if home directory unavailable
pub fn data_dir() -> PathBuf {
    let home = home_dir();
    if home == PathBuf::from(".") {
        PathBuf::from("./data")
    } else {
        home.join(".local").join("share").join("spool")
    }
}

/// Get the log directory path: ~/.local/share/spool/logs/
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}
