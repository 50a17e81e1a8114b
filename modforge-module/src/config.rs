use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ModuleError, ModuleResult};

/// Environment variable naming the module root directory (spec.md §6);
/// falls back to `mods` when unset, the teacher's config-loading idiom
/// of "env override, then a sensible default" (`knhk-config::config`).
pub const MOD_ROOT_ENV: &str = "vertx.mods";
pub const DEFAULT_MOD_ROOT: &str = "mods";

pub fn module_root() -> PathBuf {
    std::env::var(MOD_ROOT_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_MOD_ROOT))
}

#[derive(Debug, Clone, Deserialize)]
struct RawManifest {
    main: Option<String>,
    #[serde(default)]
    worker: bool,
    #[serde(default, rename = "preserve-cwd")]
    preserve_cwd: bool,
    #[serde(default, rename = "auto-redeploy")]
    auto_redeploy: bool,
    #[serde(default)]
    includes: Option<String>,
}

/// A typed view over a module's `mod.json` manifest.
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    pub main: Option<String>,
    pub worker: bool,
    pub preserve_cwd: bool,
    pub auto_redeploy: bool,
    pub includes: Vec<String>,
}

impl ModuleConfig {
    /// Absence of `main` means the module is a library, not runnable.
    pub fn is_runnable(&self) -> bool {
        self.main.is_some()
    }

    pub fn from_json(raw: &str) -> ModuleResult<Self> {
        let manifest: RawManifest = serde_json::from_str(raw).map_err(|source| ModuleError::InvalidManifest {
            path: PathBuf::new(),
            source: source.to_string(),
        })?;
        Ok(Self::from_raw(manifest))
    }

    fn from_raw(raw: RawManifest) -> Self {
        let includes = raw
            .includes
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        ModuleConfig {
            main: raw.main,
            worker: raw.worker,
            preserve_cwd: raw.preserve_cwd,
            auto_redeploy: raw.auto_redeploy,
            includes,
        }
    }

    /// Loads `<mod_root>/<name>/mod.json`.
    pub fn load(mod_root: &Path, name: &str) -> ModuleResult<Self> {
        let path = manifest_path(mod_root, name);
        if !path.exists() {
            return Err(ModuleError::MissingManifest(name.to_string()));
        }
        let contents = std::fs::read_to_string(&path)?;
        let manifest: RawManifest = serde_json::from_str(&contents)
            .map_err(|source| ModuleError::InvalidManifest { path, source: source.to_string() })?;
        Ok(Self::from_raw(manifest))
    }
}

pub fn module_dir(mod_root: &Path, name: &str) -> PathBuf {
    mod_root.join(name)
}

pub fn manifest_path(mod_root: &Path, name: &str) -> PathBuf {
    module_dir(mod_root, name).join("mod.json")
}

pub fn lib_dir(mod_root: &Path, name: &str) -> PathBuf {
    module_dir(mod_root, name).join("lib")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn includes_parses_comma_separated_and_drops_empties() {
        let cfg = ModuleConfig::from_json(
            r#"{"main":"app.js","includes":"a, b,, c ,"}"#,
        )
        .unwrap();
        assert_eq!(cfg.includes, vec!["a", "b", "c"]);
    }

    #[test]
    fn missing_main_is_not_runnable() {
        let cfg = ModuleConfig::from_json(r#"{"worker":true}"#).unwrap();
        assert!(!cfg.is_runnable());
        assert!(cfg.worker);
    }

    #[test]
    fn defaults_are_false_when_absent() {
        let cfg = ModuleConfig::from_json(r#"{"main":"app.js"}"#).unwrap();
        assert!(!cfg.worker);
        assert!(!cfg.preserve_cwd);
        assert!(!cfg.auto_redeploy);
        assert!(cfg.includes.is_empty());
    }

    #[test]
    fn load_from_disk_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let mod_root = dir.path();
        std::fs::create_dir_all(mod_root.join("my-mod")).unwrap();
        std::fs::write(
            manifest_path(mod_root, "my-mod"),
            r#"{"main":"foo.js","auto-redeploy":true}"#,
        )
        .unwrap();

        let cfg = ModuleConfig::load(mod_root, "my-mod").unwrap();
        assert_eq!(cfg.main.as_deref(), Some("foo.js"));
        assert!(cfg.auto_redeploy);
    }

    #[test]
    fn missing_manifest_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModuleConfig::load(dir.path(), "nope").unwrap_err();
        assert!(matches!(err, ModuleError::MissingManifest(_)));
    }
}
