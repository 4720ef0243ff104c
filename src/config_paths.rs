use std::path::PathBuf;

use crate::config::env_var_non_empty;
use crate::error::VaultError;

const APP_DIR_NAME: &str = "bucketlens";
const CONFIG_DIR_ENV: &str = "BUCKETLENS_CONFIG_DIR";
const CREDENTIALS_FILE_NAME: &str = "credentials.json";

pub fn bucketlens_config_dir() -> Result<PathBuf, VaultError> {
    if let Some(dir) = env_var_non_empty(CONFIG_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }

    let home = if cfg!(target_os = "windows") {
        std::env::var("USERPROFILE")
            .or_else(|_| std::env::var("HOME"))
            .map_err(|_| VaultError::Persistence("Unable to resolve USERPROFILE/HOME".to_string()))?
    } else {
        std::env::var("HOME")
            .map_err(|_| VaultError::Persistence("Unable to resolve HOME".to_string()))?
    };

    let mut path = PathBuf::from(home);
    if cfg!(target_os = "macos") {
        path.push("Library");
        path.push("Application Support");
        path.push(APP_DIR_NAME);
    } else {
        path.push(".config");
        path.push(APP_DIR_NAME);
    }
    Ok(path)
}

pub fn credentials_path() -> Result<PathBuf, VaultError> {
    Ok(bucketlens_config_dir()?.join(CREDENTIALS_FILE_NAME))
}
