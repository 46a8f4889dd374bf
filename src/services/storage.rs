// 本地配置持久化服务

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::ssh::config::TransferConfig;

/// 配置目录名
const APP_DIR: &str = "sftp-fetch";

/// 获取配置目录路径
/// macOS: ~/Library/Application Support/sftp-fetch
/// Linux: ~/.config/sftp-fetch
/// Windows: C:\Users\<用户名>\AppData\Roaming\sftp-fetch
pub fn get_config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .context("无法获取系统配置目录")?
        .join(APP_DIR))
}

/// 获取传输配置文件路径
pub fn get_config_file() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.json"))
}

/// 加载传输配置
/// 指定路径时文件必须存在；未指定时读取默认位置，不存在则使用默认配置
pub fn load_config(path: Option<&Path>) -> Result<TransferConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let path = get_config_file()?;
            if !path.exists() {
                debug!("[Config] {} not found, using defaults", path.display());
                return Ok(TransferConfig::default());
            }
            path
        }
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("无法读取配置文件 {}", path.display()))?;
    let config: TransferConfig = serde_json::from_str(&content)
        .with_context(|| format!("无法解析配置文件 {}", path.display()))?;
    debug!("[Config] Loaded {}", path.display());
    Ok(config)
}

/// 保存传输配置
pub fn save_config(config: &TransferConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("无法创建配置目录")?;
    }
    let content = serde_json::to_string_pretty(config).context("无法序列化传输配置")?;
    fs::write(path, content).context("无法写入配置文件")?;
    Ok(())
}
