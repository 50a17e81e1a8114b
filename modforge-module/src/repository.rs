use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::module_dir;

/// Default timeout a caller imposes on a single repository's install
/// attempt (spec.md §4.6).
pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Contract for remotely (or locally) fetching and unpacking a module
/// that is missing from the module root. Implementations must extract
/// the module such that `<mod_root>/<name>/mod.json` exists on success.
/// Timeout, transport errors, and malformed archives are all non-fatal
/// signals: the caller just tries the next configured repository.
#[async_trait]
pub trait ModuleRepository: Send + Sync {
    /// A short label used in logs and warnings.
    fn name(&self) -> &str;

    async fn install(&self, module_name: &str, mod_root: &Path) -> bool;
}

/// Tries every configured repository in order, stopping at the first
/// success, the way `ModuleResolver::install` does (spec.md §4.5). Not
/// thread-safe to mutate after start-up, matching spec.md §5's note on
/// the repository list.
pub struct RepositoryList {
    repos: Vec<Box<dyn ModuleRepository>>,
}

impl RepositoryList {
    pub fn new(repos: Vec<Box<dyn ModuleRepository>>) -> Self {
        RepositoryList { repos }
    }

    pub fn empty() -> Self {
        RepositoryList { repos: Vec::new() }
    }

    pub async fn install(&self, module_name: &str, mod_root: &Path) -> bool {
        for repo in &self.repos {
            debug!(repo = repo.name(), module = module_name, "attempting install");
            let outcome = tokio::time::timeout(
                DEFAULT_INSTALL_TIMEOUT,
                repo.install(module_name, mod_root),
            )
            .await;
            match outcome {
                Ok(true) => return true,
                Ok(false) => warn!(repo = repo.name(), module = module_name, "repository declined"),
                Err(_) => warn!(repo = repo.name(), module = module_name, "repository timed out"),
            }
        }
        false
    }
}

/// A `ModuleRepository` backed by a plain directory of pre-built module
/// trees, standing in for a real archive-download-and-unpack repository
/// (spec.md's repository network implementation is out of scope). Used
/// by tests and by the literal S1/S2 fixtures: "the repository contains
/// testmod1-1" just means it's a subdirectory of the source root here.
pub struct FsModuleRepository {
    label: String,
    source_root: PathBuf,
}

impl FsModuleRepository {
    pub fn new(label: impl Into<String>, source_root: impl Into<PathBuf>) -> Self {
        FsModuleRepository {
            label: label.into(),
            source_root: source_root.into(),
        }
    }
}

#[async_trait]
impl ModuleRepository for FsModuleRepository {
    fn name(&self) -> &str {
        &self.label
    }

    async fn install(&self, module_name: &str, mod_root: &Path) -> bool {
        let src = module_dir(&self.source_root, module_name);
        let dest = module_dir(mod_root, module_name);
        if !src.join("mod.json").exists() {
            return false;
        }
        match copy_tree(&src, &dest) {
            Ok(()) => dest.join("mod.json").exists(),
            Err(e) => {
                warn!(module = module_name, error = %e, "fs repository copy failed");
                false
            }
        }
    }
}

fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let dest_path = dest.join(entry.file_name());
        if ty.is_dir() {
            copy_tree(&entry.path(), &dest_path)?;
        } else {
            std::fs::copy(entry.path(), &dest_path)?;
        }
    }
    Ok(())
}
