use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use tracing::{info, warn};

use crate::config::{lib_dir, module_dir, ModuleConfig};
use crate::repository::RepositoryList;

/// Accumulator built up over one `ModuleResolver::resolve` call. Handed
/// to the caller and never mutated again once resolution completes.
#[derive(Debug, Clone, Default)]
pub struct ModuleDependencies {
    pub root_module_name: String,
    pub urls: Vec<String>,
    pub included_jars: BTreeMap<String, Vec<String>>,
    pub included_modules: BTreeSet<String>,
    /// Depth-first visit order, distinct from `included_modules` (a set)
    /// so walker-order assertions (spec.md §8 S3) have something to
    /// check against.
    pub visited_order: Vec<String>,
    pub success: bool,
    pub warnings: Vec<String>,
}

impl ModuleDependencies {
    fn new(root: &str) -> Self {
        ModuleDependencies {
            root_module_name: root.to_string(),
            success: true,
            ..Default::default()
        }
    }

    fn push_url(&mut self, url: String) {
        if !self.urls.contains(&url) {
            self.urls.push(url);
        }
    }

    fn fail(&mut self, warning: String) {
        self.success = false;
        warn!(%warning, "module resolution warning");
        self.warnings.push(warning);
    }
}

/// Walks a module's transitive include graph, installing missing
/// modules via the configured repositories, detecting jar basename
/// collisions, and building an ordered classpath. Cycles are impossible
/// because each module is visited at most once, guarded by
/// `included_modules` membership.
pub struct ModuleResolver {
    mod_root: PathBuf,
    repositories: RepositoryList,
}

impl ModuleResolver {
    pub fn new(mod_root: PathBuf, repositories: RepositoryList) -> Self {
        ModuleResolver {
            mod_root,
            repositories,
        }
    }

    pub fn mod_root(&self) -> &PathBuf {
        &self.mod_root
    }

    /// Installs `name` if its directory is missing, trying each
    /// configured repository in turn and stopping at the first success.
    pub async fn install(&self, name: &str) -> bool {
        if module_dir(&self.mod_root, name).exists() {
            return true;
        }
        self.repositories.install(name, &self.mod_root).await
    }

    /// Resolves `name`'s transitive classpath, installing missing
    /// includes along the way. Idempotent: repeated calls against an
    /// unchanged module tree return the same ordering and the same
    /// `included_modules` set (spec.md §8 property 5).
    pub async fn resolve(&self, name: &str) -> ModuleDependencies {
        let mut deps = ModuleDependencies::new(name);
        self.resolve_into(name, &mut deps).await;
        deps
    }

    fn resolve_into<'a>(
        &'a self,
        name: &'a str,
        deps: &'a mut ModuleDependencies,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if deps.included_modules.contains(name) {
                return;
            }

            if !self.install(name).await {
                deps.fail(format!("install failed for module '{name}'"));
                return;
            }

            let config = match ModuleConfig::load(&self.mod_root, name) {
                Ok(cfg) => cfg,
                Err(e) => {
                    deps.fail(format!("manifest error for module '{name}': {e}"));
                    return;
                }
            };

            // (i) this module's own directory precedes anything it includes.
            let dir_uri = module_dir(&self.mod_root, name).to_string_lossy().to_string();
            deps.push_url(dir_uri);

            // (ii) its own jars precede an include's contributions too.
            self.collect_jars(name, deps);

            // (iii) mark visited before recursing, closing off cycles.
            deps.included_modules.insert(name.to_string());
            deps.visited_order.push(name.to_string());
            info!(module = name, "resolved module into classpath");

            // (iv) recurse over includes not yet visited.
            for include in &config.includes {
                if deps.included_modules.contains(include) {
                    continue;
                }
                if !self.install(include).await {
                    deps.fail(format!("install failed for module '{include}'"));
                    continue;
                }
                self.resolve_into(include, deps).await;
            }
        })
    }

    fn collect_jars(&self, name: &str, deps: &mut ModuleDependencies) {
        let lib = lib_dir(&self.mod_root, name);
        let Ok(entries) = std::fs::read_dir(&lib) else {
            return;
        };
        let mut jars: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.path())
            .collect();
        jars.sort();

        for jar in jars {
            let basename = jar
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            match deps.included_jars.get_mut(&basename) {
                Some(contributors) => {
                    let warning = format!(
                        "jar '{basename}' contributed by both '{}' and '{name}'",
                        contributors.last().expect("non-empty")
                    );
                    contributors.push(name.to_string());
                    warn!(%warning, "jar collision");
                    deps.warnings.push(warning);
                }
                None => {
                    deps.included_jars.insert(basename, vec![name.to_string()]);
                    deps.push_url(jar.to_string_lossy().to_string());
                }
            }
        }
    }
}
