// Writable cache/home overrides for package managers
//
// Pods run with read-only root filesystems as an unprivileged user, so every
// package manager gets its caches redirected under the adapter's cache root.
// Both the installer and the supervisor build their environment here.

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    Uv,
    Pip,
}

impl PackageManager {
    /// The package manager whose caches a launcher program touches, if any
    pub fn for_program(program: &str) -> Option<Self> {
        match program {
            "npx" | "npm" | "node" => Some(Self::Npm),
            "uvx" | "uv" => Some(Self::Uv),
            "pip" | "pip3" => Some(Self::Pip),
            _ => None,
        }
    }
}

/// Environment overrides for running `manager` with caches under `cache_root`
pub fn sandbox_env(manager: PackageManager, cache_root: &Path) -> Vec<(String, String)> {
    let path = |sub: &str| cache_root.join(sub).to_string_lossy().into_owned();
    let home = ("HOME".to_string(), path("home"));

    match manager {
        PackageManager::Npm => vec![
            home,
            ("npm_config_cache".to_string(), path("npm-cache")),
            ("npm_config_update_notifier".to_string(), "false".to_string()),
            ("npm_config_fund".to_string(), "false".to_string()),
            ("NO_UPDATE_NOTIFIER".to_string(), "1".to_string()),
        ],
        PackageManager::Uv => vec![
            home,
            ("UV_CACHE_DIR".to_string(), path("uv-cache")),
            ("UV_TOOL_DIR".to_string(), path("uv-tools")),
            ("UV_PYTHON_INSTALL_DIR".to_string(), path("uv-python")),
            ("XDG_CACHE_HOME".to_string(), path("xdg-cache")),
        ],
        PackageManager::Pip => vec![
            home,
            ("PIP_CACHE_DIR".to_string(), path("pip-cache")),
            ("PIP_DISABLE_PIP_VERSION_CHECK".to_string(), "1".to_string()),
            ("PIP_NO_INPUT".to_string(), "1".to_string()),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_program() {
        assert_eq!(PackageManager::for_program("npx"), Some(PackageManager::Npm));
        assert_eq!(PackageManager::for_program("node"), Some(PackageManager::Npm));
        assert_eq!(PackageManager::for_program("uvx"), Some(PackageManager::Uv));
        assert_eq!(PackageManager::for_program("python3"), None);
    }

    #[test]
    fn test_all_paths_live_under_cache_root() {
        let root = Path::new("/tmp/mcp-packages");
        for manager in [PackageManager::Npm, PackageManager::Uv, PackageManager::Pip] {
            let env = sandbox_env(manager, root);
            let home = env.iter().find(|(k, _)| k == "HOME").unwrap();
            assert_eq!(home.1, "/tmp/mcp-packages/home");
            for (_, value) in env.iter().filter(|(_, v)| v.starts_with('/')) {
                assert!(value.starts_with("/tmp/mcp-packages/"), "{} escapes cache root", value);
            }
        }
    }

    #[test]
    fn test_npm_cache_override() {
        let env = sandbox_env(PackageManager::Npm, Path::new("/cache"));
        assert!(env.contains(&("npm_config_cache".to_string(), "/cache/npm-cache".to_string())));
    }
}
