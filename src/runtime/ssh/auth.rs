//! SSH 认证
//!
//! 支持密码和私钥认证方式。

use std::path::Path;

use russh_keys::key::KeyPair;

use crate::config::HostConfig;
use crate::utils::error::BridgeError;

/// 认证方式
#[derive(Debug, Clone, Default)]
pub enum AuthMethod {
    /// 无显式凭据：先尝试默认私钥，再尝试 none 认证
    #[default]
    None,
    /// 密码认证
    Password(String),
    /// 私钥认证
    PrivateKey {
        /// 私钥文件路径
        path: String,
        /// 私钥密码（可选）
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    /// 根据主机配置选择认证方式，私钥优先于密码
    pub fn from_host(host: &HostConfig) -> Self {
        if let Some(path) = &host.identity_file {
            AuthMethod::PrivateKey {
                path: path.to_string_lossy().to_string(),
                passphrase: host.password.clone(),
            }
        } else if let Some(password) = &host.password {
            AuthMethod::Password(password.clone())
        } else {
            AuthMethod::None
        }
    }

    /// 认证方式名称（用于日志）
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PrivateKey { .. } => "publickey",
        }
    }
}

/// 加载私钥文件
///
/// 支持 OpenSSH 格式和 PEM 格式的私钥。
pub fn load_private_key(path: &str, passphrase: Option<&str>) -> Result<KeyPair, BridgeError> {
    let path = expand_tilde(path);
    let key_path = Path::new(&path);

    if !key_path.exists() {
        return Err(BridgeError::key_load_failed(&path, "文件不存在"));
    }

    // 检查文件权限（仅 Unix）
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(key_path) {
            let mode = metadata.permissions().mode();
            if mode & 0o077 != 0 {
                tracing::warn!(
                    "私钥文件 {} 权限过于宽松 (mode: {:o})，建议设置为 600",
                    path,
                    mode & 0o777
                );
            }
        }
    }

    let key_data = std::fs::read_to_string(key_path)
        .map_err(|e| BridgeError::key_load_failed(&path, &format!("无法读取文件: {}", e)))?;

    let key = russh_keys::decode_secret_key(&key_data, passphrase).map_err(|e| {
        let err_str = e.to_string().to_lowercase();
        if passphrase.is_none() && (err_str.contains("passphrase") || err_str.contains("encrypted"))
        {
            BridgeError::key_load_failed(&path, "私钥已加密，需要提供密码")
        } else {
            BridgeError::key_load_failed(&path, &format!("解析失败: {}", e))
        }
    })?;

    tracing::debug!("成功加载私钥: {}", path);
    Ok(key)
}

/// 展开路径中的 ~ 为用户主目录
fn expand_tilde(path: &str) -> String {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}

/// 获取默认 SSH 私钥路径列表，按优先级排序
pub fn default_identity_files() -> Vec<String> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    let ssh_dir = home.join(".ssh");

    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .filter(|path| path.exists())
        .map(|path| path.to_string_lossy().to_string())
        .collect()
}

/// 按优先级尝试加载默认私钥
pub fn try_load_default_key() -> Option<(String, KeyPair)> {
    for path in default_identity_files() {
        match load_private_key(&path, None) {
            Ok(key) => {
                tracing::info!("使用默认私钥: {}", path);
                return Some((path, key));
            }
            Err(e) => {
                tracing::debug!("无法加载私钥 {}: {}", path, e);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn host(identity_file: Option<&str>, password: Option<&str>) -> HostConfig {
        HostConfig {
            name: "vps".to_string(),
            host: "example.com".to_string(),
            port: 22,
            user: "root".to_string(),
            identity_file: identity_file.map(PathBuf::from),
            password: password.map(str::to_string),
        }
    }

    #[test]
    fn test_auth_method_default() {
        assert!(matches!(AuthMethod::default(), AuthMethod::None));
    }

    #[test]
    fn test_auth_method_from_host() {
        assert!(matches!(AuthMethod::from_host(&host(None, None)), AuthMethod::None));
        assert!(matches!(
            AuthMethod::from_host(&host(None, Some("secret"))),
            AuthMethod::Password(_)
        ));

        match AuthMethod::from_host(&host(Some("/keys/id"), Some("phrase"))) {
            AuthMethod::PrivateKey { path, passphrase } => {
                assert_eq!(path, "/keys/id");
                assert_eq!(passphrase.as_deref(), Some("phrase"));
            }
            other => panic!("Expected PrivateKey, got {:?}", other),
        }
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde("~/test/path");
        assert!(!expanded.starts_with("~/"));

        assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
    }

    #[test]
    fn test_load_nonexistent_key() {
        let result = load_private_key("/nonexistent/path/to/key", None);
        match result {
            Err(BridgeError::PrivateKeyLoadFailed(msg)) => assert!(msg.contains("文件不存在")),
            _ => panic!("Expected PrivateKeyLoadFailed error"),
        }
    }

    #[test]
    fn test_load_garbage_key() {
        let path = std::env::temp_dir().join(format!("terminal-bridge-key-{}", uuid::Uuid::new_v4()));
        std::fs::write(&path, "not a key").unwrap();

        let result = load_private_key(&path.to_string_lossy(), None);
        assert!(matches!(result, Err(BridgeError::PrivateKeyLoadFailed(_))));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_default_identity_files() {
        for path in default_identity_files() {
            assert!(Path::new(&path).exists());
        }
    }
}
