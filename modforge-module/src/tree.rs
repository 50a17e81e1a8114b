use std::path::PathBuf;

use dashmap::DashMap;

use crate::config::ModuleConfig;
use crate::error::{ModuleError, ModuleResult};

/// One node in the deployment hierarchy. Keyed by its unique deployment
/// name, not by module name — the same module can be deployed under
/// many names. Execution state (verticle holders, execution contexts)
/// lives in `VerticleRuntime`, keyed by this same name; the tree only
/// tracks naming, ancestry, and the metadata needed to redeploy.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub name: String,
    pub module_name: String,
    pub instance_count: usize,
    pub config: ModuleConfig,
    pub classpath_urls: Vec<String>,
    pub mod_dir: PathBuf,
    pub auto_redeploy: bool,
    pub parent: Option<String>,
    pub children: Vec<String>,
}

/// Parent/child deployment hierarchy backed by a concurrent map so
/// reads (used heavily by CLI status output and the runtime) never
/// block on a writer (spec.md §4.7: "a concurrent map").
pub struct DeploymentTree {
    deployments: DashMap<String, Deployment>,
}

impl Default for DeploymentTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DeploymentTree {
    pub fn new() -> Self {
        DeploymentTree {
            deployments: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.deployments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deployments.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.deployments.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Deployment> {
        self.deployments.get(name).map(|r| r.clone())
    }

    /// Registers a new deployment under `parent`, linking it into the
    /// parent's child list. Errors if `name` is already taken or
    /// `parent` doesn't exist.
    #[allow(clippy::too_many_arguments)]
    pub fn deploy(
        &self,
        name: &str,
        module_name: &str,
        instance_count: usize,
        config: ModuleConfig,
        classpath_urls: Vec<String>,
        mod_dir: PathBuf,
        auto_redeploy: bool,
        parent: Option<&str>,
    ) -> ModuleResult<()> {
        if self.deployments.contains_key(name) {
            return Err(ModuleError::DuplicateDeployment(name.to_string()));
        }
        if let Some(parent_name) = parent {
            let mut entry = self
                .deployments
                .get_mut(parent_name)
                .ok_or_else(|| ModuleError::MissingParent(parent_name.to_string()))?;
            entry.children.push(name.to_string());
        }
        self.deployments.insert(
            name.to_string(),
            Deployment {
                name: name.to_string(),
                module_name: module_name.to_string(),
                instance_count,
                config,
                classpath_urls,
                mod_dir,
                auto_redeploy,
                parent: parent.map(str::to_string),
                children: Vec::new(),
            },
        );
        Ok(())
    }

    /// Undeploys `name` and its entire subtree, children before parent
    /// at every level (spec.md §8 property 7: "depth-first-complete").
    /// Returns the removed deployments in teardown order, so a caller
    /// (the verticle runtime) can stop their instances and notify the
    /// redeployer without a second tree walk.
    pub fn undeploy(&self, name: &str) -> ModuleResult<Vec<Deployment>> {
        let mut order = Vec::new();
        self.undeploy_into(name, &mut order)?;
        Ok(order)
    }

    fn undeploy_into(&self, name: &str, order: &mut Vec<Deployment>) -> ModuleResult<()> {
        let children = self
            .deployments
            .get(name)
            .ok_or_else(|| ModuleError::UnknownDeployment(name.to_string()))?
            .children
            .clone();

        for child in children {
            self.undeploy_into(&child, order)?;
        }

        if let Some((_, removed)) = self.deployments.remove(name) {
            if let Some(parent_name) = &removed.parent {
                if let Some(mut parent) = self.deployments.get_mut(parent_name) {
                    parent.children.retain(|c| c != name);
                }
            }
            order.push(removed);
        }
        Ok(())
    }

    /// Deployments whose `module_name` matches — how the redeployer
    /// decides which deployments are "bound to" a changed module
    /// (spec.md §4.9).
    pub fn deployments_for_module(&self, module_name: &str) -> Vec<Deployment> {
        self.deployments
            .iter()
            .filter(|e| e.module_name == module_name)
            .map(|e| e.clone())
            .collect()
    }

    /// Roots-first indented tree (spec.md §4.7).
    pub fn print(&self, out: &mut impl std::fmt::Write) -> std::fmt::Result {
        let mut roots: Vec<String> = self
            .deployments
            .iter()
            .filter(|e| e.parent.is_none())
            .map(|e| e.key().clone())
            .collect();
        roots.sort();
        for root in &roots {
            self.print_node(root, 0, out)?;
        }
        Ok(())
    }

    fn print_node(&self, name: &str, depth: usize, out: &mut impl std::fmt::Write) -> std::fmt::Result {
        let children = match self.deployments.get(name) {
            Some(dep) => {
                writeln!(out, "{}{} ({})", "  ".repeat(depth), name, dep.module_name)?;
                let mut children = dep.children.clone();
                children.sort();
                children
            }
            None => return Ok(()),
        };
        for child in &children {
            self.print_node(child, depth + 1, out)?;
        }
        Ok(())
    }
}
