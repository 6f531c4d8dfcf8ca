// Package specifications and just-in-time installation

mod installer;
mod sandbox;

pub use installer::{find_on_path, CommandOutput, CommandRunner, Invocation, PackageInstaller, ProcessRunner};
pub use sandbox::{sandbox_env, PackageManager};

use crate::config::program_name;
use crate::error::AdapterError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where a package comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
    Npm,
    Pypi,
    Github,
    Executable,
}

impl PackageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::Pypi => "pypi",
            Self::Github => "github",
            Self::Executable => "executable",
        }
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageType {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "npm" => Ok(Self::Npm),
            "pypi" => Ok(Self::Pypi),
            "github" => Ok(Self::Github),
            "executable" => Ok(Self::Executable),
            other => Err(AdapterError::install(
                format!("{}:?", other),
                format!("unknown package type {:?}", other),
            )),
        }
    }
}

/// Declarative description of something that must be present before the server starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    #[serde(rename = "type")]
    pub package_type: PackageType,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, rename = "installArgs", skip_serializing_if = "Vec::is_empty")]
    pub install_args: Vec<String>,
}

impl PackageSpec {
    pub fn new(package_type: PackageType, source: impl Into<String>) -> Self {
        Self {
            package_type,
            source: source.into(),
            version: None,
            install_args: Vec::new(),
        }
    }

    pub fn npm(source: impl Into<String>, version: Option<String>) -> Self {
        Self {
            version,
            ..Self::new(PackageType::Npm, source)
        }
    }

    pub fn executable(source: impl Into<String>) -> Self {
        Self::new(PackageType::Executable, source)
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_install_args(mut self, args: Vec<String>) -> Self {
        self.install_args = args;
        self
    }

    /// Memoization key, `"{type}:{source}"`
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.package_type, self.source)
    }

    /// Infer what must be installed from the command line the server is launched with.
    ///
    /// - `npx [flags] <pkg>[@version] ...` installs `<pkg>` from npm
    /// - `uvx ...` only needs `uvx` itself, it resolves packages at run time
    /// - `npm ... install [flags] <pkg>` installs `<pkg>` with the remaining flags
    /// - anything else is verified to exist on PATH
    pub fn detect(executable: &str, args: &[String]) -> Self {
        match program_name(executable) {
            "npx" => {
                if let Some(index) = npx_package_index(args) {
                    let (name, version) = split_npm_version(&args[index]);
                    return Self::npm(name, version);
                }
            }
            "uvx" => return Self::executable("uvx"),
            "npm" => {
                if let Some(install) = args.iter().position(|a| a == "install" || a == "i") {
                    let rest = &args[install + 1..];
                    if let Some(package) = rest.iter().find(|a| !a.starts_with('-')) {
                        let (name, version) = split_npm_version(package);
                        let flags = rest.iter().filter(|a| a.starts_with('-')).cloned().collect();
                        return Self::npm(name, version).with_install_args(flags);
                    }
                }
            }
            _ => {}
        }

        Self::executable(executable)
    }

    /// Package name with its version pin, as an installer argument
    pub(crate) fn requirement(&self, separator: &str) -> String {
        match &self.version {
            Some(version) => format!("{}{}{}", self.source, separator, version),
            None => self.source.clone(),
        }
    }
}

/// Position of the package argument in an `npx` argument list
pub fn npx_package_index(args: &[String]) -> Option<usize> {
    args.iter().position(|arg| !arg.starts_with('-'))
}

/// Split `name@version`, keeping the leading `@` of scoped packages
fn split_npm_version(package: &str) -> (String, Option<String>) {
    let (scope, rest) = match package.strip_prefix('@') {
        Some(rest) => ("@", rest),
        None => ("", package),
    };

    match rest.split_once('@') {
        Some((name, version)) if !version.is_empty() => {
            (format!("{}{}", scope, name), Some(version.to_string()))
        }
        Some((name, _)) => (format!("{}{}", scope, name), None),
        None => (package.to_string(), None),
    }
}

/// Directory-safe form of a package or repository name
pub(crate) fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_detect_npx_package() {
        let spec = PackageSpec::detect("npx", &args(&["-y", "some-pkg"]));
        assert_eq!(spec, PackageSpec::npm("some-pkg", None));
        assert_eq!(spec.cache_key(), "npm:some-pkg");
    }

    #[test]
    fn test_detect_npx_scoped_and_versioned() {
        let spec = PackageSpec::detect(
            "/usr/bin/npx",
            &args(&["-y", "@modelcontextprotocol/server-filesystem@0.6.2", "/data"]),
        );
        assert_eq!(spec.package_type, PackageType::Npm);
        assert_eq!(spec.source, "@modelcontextprotocol/server-filesystem");
        assert_eq!(spec.version.as_deref(), Some("0.6.2"));
    }

    #[test]
    fn test_detect_npx_without_package_is_verify_only() {
        let spec = PackageSpec::detect("npx", &args(&["--version"]));
        assert_eq!(spec, PackageSpec::executable("npx"));
    }

    #[test]
    fn test_detect_uvx_verifies_uvx_only() {
        let spec = PackageSpec::detect("uvx", &args(&["mcp-server-fetch"]));
        assert_eq!(spec, PackageSpec::executable("uvx"));
    }

    #[test]
    fn test_detect_npm_install() {
        let spec = PackageSpec::detect("npm", &args(&["install", "--legacy-peer-deps", "left-pad@1.3.0"]));
        assert_eq!(spec.package_type, PackageType::Npm);
        assert_eq!(spec.source, "left-pad");
        assert_eq!(spec.version.as_deref(), Some("1.3.0"));
        assert_eq!(spec.install_args, args(&["--legacy-peer-deps"]));
    }

    #[test]
    fn test_detect_plain_executable() {
        let spec = PackageSpec::detect("/opt/bin/my-server", &args(&["--stdio"]));
        assert_eq!(spec, PackageSpec::executable("/opt/bin/my-server"));
        assert_eq!(spec.cache_key(), "executable:/opt/bin/my-server");
    }

    #[test]
    fn test_package_type_from_str() {
        assert_eq!("pypi".parse::<PackageType>().unwrap(), PackageType::Pypi);
        assert!("cargo".parse::<PackageType>().is_err());
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("@scope/pkg"), "_scope_pkg");
        assert_eq!(sanitize_name("server-fetch_1.0"), "server-fetch_1.0");
    }

    #[test]
    fn test_requirement() {
        let spec = PackageSpec::new(PackageType::Pypi, "mcp-server-git").with_version("0.6.0");
        assert_eq!(spec.requirement("=="), "mcp-server-git==0.6.0");
        assert_eq!(PackageSpec::npm("x", None).requirement("@"), "x");
    }
}
