use crate::error::{Error, Result};
use indoc::indoc;
use std::path::Path;
use tempdir::TempDir;

const DEFAULT_CONFIG: &str = indoc! {r#"
appenders:
  stdout:
    kind: console
    encoder:
      pattern: "{h({d(%Y-%m-%d %H:%M:%S)(utc)} - {l} - {f}:{L} - {m}{n})}"
  file_logger:
    kind: rolling_file
    path: "logs/boxtrack-rs.log"
    encoder:
      pattern: "{d(%Y-%m-%d %H:%M:%S)(utc)} - {l} - {f}:{L} - {m}{n}"
    policy:
      trigger:
        kind: size
        limit: 1Mb
      roller:
        kind: fixed_window
        base: 1
        count: 3
        pattern: "logs/boxtrack-rs_{}.log"
root:
  level: info
  appenders:
    - stdout
    - file_logger
"#};

fn init_file(path: &Path) -> Result<()> {
    log4rs::init_file(path, Default::default())
        .map_err(|e| Error::Configuration(format!("logging setup from {} failed: {e}", path.display())))
}

/// Uses `log4rs.yaml` next to the executable, the built-in config otherwise.
pub fn setup_logging() -> Result<()> {
    let mut log_file_path = std::env::current_exe()?;
    log_file_path.pop();
    log_file_path.push("log4rs.yaml");

    if log_file_path.exists() {
        return init_file(&log_file_path);
    }

    // the application directory may be read only
    let tmp_dir = TempDir::new("boxtrack-rs")?;
    let tmp_log_config = tmp_dir.path().join("log4rs.yaml");
    std::fs::write(&tmp_log_config, DEFAULT_CONFIG)?;
    init_file(&tmp_log_config)
}

