use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::action::{ActionFuture, BlockingActionRunner};
use crate::config::{module_dir, ModuleConfig};
use crate::error::{ModuleError, ModuleResult};
use crate::factory::{ExecutionContext, FactoryRegistry, Verticle};
use crate::resolver::ModuleResolver;
use crate::tree::{Deployment, DeploymentTree};

thread_local! {
    static ON_WORKER_THREAD: Cell<bool> = Cell::new(false);
}

/// Marks the calling OS thread as a deployment worker thread. Deploy and
/// undeploy refuse to run anywhere else (spec.md §5: "runtime enforces
/// this with a guard that throws if invoked elsewhere"). `BlockingActionRunner`
/// calls this once at the top of every blocking closure it spawns, so
/// code reached through the public `deploy_module`/`undeploy` API is
/// always on a marked thread; calling the `*_blocking` inherent methods
/// directly from an unmarked thread is what this guard catches.
pub struct WorkerThreadGuard;

impl WorkerThreadGuard {
    pub fn mark_current_thread() {
        ON_WORKER_THREAD.with(|f| f.set(true));
    }

    pub fn is_worker_thread() -> bool {
        ON_WORKER_THREAD.with(|f| f.get())
    }
}

fn require_worker_thread() -> ModuleResult<()> {
    if WorkerThreadGuard::is_worker_thread() {
        Ok(())
    } else {
        let thread_name = std::thread::current().name().unwrap_or("<unnamed>").to_string();
        Err(ModuleError::NotOnWorkerThread(thread_name))
    }
}

/// Observer the runtime notifies when a module opts into auto-redeploy,
/// so a `modforge-redeploy` engine can start (or stop) watching its
/// directory. `modforge-module` never depends on `modforge-redeploy`
/// itself — the dependency points the other way — so this trait is the
/// seam between them (spec.md §4.9's "Reloader coupling").
pub trait RedeployObserver: Send + Sync {
    fn module_deployed(&self, module_name: &str, mod_dir: &Path, deployment_name: &str);
    fn module_undeployed(&self, deployment_name: &str);
}

/// Callback a redeploy engine drives once a module's directory has gone
/// quiet after a change (spec.md §4.9): undeploy then redeploy every
/// bound deployment as one batch.
pub trait Reloader: Send + Sync {
    fn reload_modules(&self, deployments: Vec<Deployment>);
}

/// A single running instance under one deployment (spec.md's
/// `VerticleHolder`): the context handed to its lifecycle hooks and the
/// `Verticle` itself.
pub struct VerticleHolder {
    pub execution_context: ExecutionContext,
    verticle: Mutex<Box<dyn Verticle>>,
}

/// Creates per-instance execution units from a dependency-resolved
/// module and drives their lifecycle (spec.md §4.8). Deploy/undeploy
/// are exposed as `ActionFuture`-returning calls onto the worker pool
/// (spec.md §5: "asynchronous APIs wrap the blocking work in a
/// 'blocking action'"); the synchronous pipeline underneath is
/// `resolve -> plan -> launch`, replacing the source's re-entrant
/// `deploy -> install -> deploy` chain (spec.md §9).
pub struct VerticleRuntime {
    resolver: ModuleResolver,
    tree: Arc<DeploymentTree>,
    factories: FactoryRegistry,
    holders: DashMap<String, Vec<Arc<VerticleHolder>>>,
    redeploy: Mutex<Option<Arc<dyn RedeployObserver>>>,
    self_weak: OnceLock<Weak<VerticleRuntime>>,
}

impl VerticleRuntime {
    pub fn new(resolver: ModuleResolver, tree: Arc<DeploymentTree>, factories: FactoryRegistry) -> Arc<Self> {
        let runtime = Arc::new(VerticleRuntime {
            resolver,
            tree,
            factories,
            holders: DashMap::new(),
            redeploy: Mutex::new(None),
            self_weak: OnceLock::new(),
        });
        let _ = runtime.self_weak.set(Arc::downgrade(&runtime));
        runtime
    }

    pub fn tree(&self) -> &DeploymentTree {
        &self.tree
    }

    /// The shared deployment tree handle, for wiring a `modforge-redeploy`
    /// engine (which needs its own `Arc<DeploymentTree>` to look up
    /// `deployments_for_module` independently of the runtime).
    pub fn tree_handle(&self) -> Arc<DeploymentTree> {
        Arc::clone(&self.tree)
    }

    pub fn set_redeploy_observer(&self, observer: Arc<dyn RedeployObserver>) {
        *self.redeploy.lock().unwrap() = Some(observer);
    }

    fn notify_deployed(&self, dep: &Deployment) {
        if dep.auto_redeploy {
            if let Some(obs) = self.redeploy.lock().unwrap().clone() {
                obs.module_deployed(&dep.module_name, &dep.mod_dir, &dep.name);
            }
        }
    }

    fn notify_undeployed(&self, dep: &Deployment) {
        if dep.auto_redeploy {
            if let Some(obs) = self.redeploy.lock().unwrap().clone() {
                obs.module_undeployed(&dep.name);
            }
        }
    }

    /// Deploys a module by name, resolving its classpath first (spec.md
    /// §4.8 `deploy_module`). Runs on the worker pool; the returned
    /// future resolves with the deployment name, or the failure.
    #[allow(clippy::too_many_arguments)]
    pub fn deploy_module(
        self: &Arc<Self>,
        dep_name: Option<String>,
        module_name: String,
        instances: usize,
        cwd_override: Option<PathBuf>,
        parent: Option<String>,
    ) -> ActionFuture<String, ModuleError> {
        let runtime = Arc::clone(self);
        BlockingActionRunner::spawn(move || {
            WorkerThreadGuard::mark_current_thread();
            let handle = tokio::runtime::Handle::current();
            handle.block_on(runtime.deploy_module_blocking(dep_name, module_name, instances, cwd_override, parent))
        })
    }

    async fn deploy_module_blocking(
        self: Arc<Self>,
        dep_name: Option<String>,
        module_name: String,
        instances: usize,
        cwd_override: Option<PathBuf>,
        parent: Option<String>,
    ) -> ModuleResult<String> {
        require_worker_thread()?;

        let deps = self.resolver.resolve(&module_name).await;
        if !deps.success {
            return Err(ModuleError::ResolutionFailed {
                root: module_name,
                warnings: deps.warnings,
            });
        }

        let config = ModuleConfig::load(self.resolver.mod_root(), &module_name)?;
        if !config.is_runnable() {
            return Err(ModuleError::NotRunnable(module_name));
        }

        let mod_dir = module_dir(self.resolver.mod_root(), &module_name);
        let effective_cwd = if config.preserve_cwd {
            cwd_override.unwrap_or_else(|| mod_dir.clone())
        } else {
            mod_dir.clone()
        };

        let main = config.main.clone().expect("is_runnable checked main is present");
        let factory = self.factories.resolve(&main);
        let name = dep_name.unwrap_or_else(|| Uuid::new_v4().to_string());

        self.tree.deploy(
            &name,
            &module_name,
            instances,
            config.clone(),
            deps.urls.clone(),
            mod_dir.clone(),
            config.auto_redeploy,
            parent.as_deref(),
        )?;

        // Worker modules share one loader identity across instances so
        // static/singleton state is shared; non-workers get one each
        // (spec.md §4.8 step 6).
        let shared_loader_id = Uuid::new_v4();

        let mut tasks = Vec::with_capacity(instances);
        for _ in 0..instances {
            let factory = factory.clone();
            let main = main.clone();
            let ctx = ExecutionContext {
                deployment_name: name.clone(),
                module_name: module_name.clone(),
                urls: deps.urls.clone(),
                cwd: effective_cwd.clone(),
                worker: config.worker,
                loader_id: if config.worker { shared_loader_id } else { Uuid::new_v4() },
            };
            tasks.push(tokio::task::spawn_blocking(move || {
                let result = factory.create_verticle(&main).and_then(|mut v| {
                    v.start(&ctx)?;
                    Ok(v)
                });
                (ctx, result)
            }));
        }

        // Instance launches happen in index order above but may complete
        // in any order once spawned; aggregate failures here rather than
        // with the source's per-deployment handler object (spec.md §9).
        let mut holders = Vec::with_capacity(instances);
        let mut any_failed = false;
        for task in tasks {
            match task.await {
                Ok((ctx, Ok(verticle))) => {
                    holders.push(Arc::new(VerticleHolder {
                        execution_context: ctx,
                        verticle: Mutex::new(verticle),
                    }));
                }
                Ok((ctx, Err(e))) => {
                    warn!(deployment = %name, instance_cwd = ?ctx.cwd, error = %e, "instance failed to start");
                    any_failed = true;
                }
                Err(join_err) => {
                    warn!(deployment = %name, error = %join_err, "instance launch task panicked");
                    any_failed = true;
                }
            }
        }

        // Registered before the failure check so `undeploy_blocking` can
        // find and `stop()` whatever instances did start, even though the
        // overall launch is about to be torn down (spec.md §4.8 step 6,
        // §5's close-hooks-before-removal guarantee).
        self.holders.insert(name.clone(), holders);

        if any_failed {
            warn!(deployment = %name, "partially created deployment is being undeployed");
            self.undeploy_blocking(&name)?;
            return Err(ModuleError::StartFailed(name));
        }

        info!(deployment = %name, module = %module_name, instances, "deployment completed");
        if let Some(dep) = self.tree.get(&name) {
            self.notify_deployed(&dep);
        }
        Ok(name)
    }

    /// Deploys an ad-hoc verticle `main` against a preset classpath
    /// rather than a named module (spec.md §4.8 `deploy_verticle`). No
    /// `Deployment::module_name` is meaningfully set; it is recorded as
    /// an empty string so the tree's "bound to a module" matching
    /// (`deployments_for_module`) never accidentally matches it.
    #[allow(clippy::too_many_arguments)]
    pub fn deploy_verticle(
        self: &Arc<Self>,
        dep_name: Option<String>,
        worker: bool,
        main: String,
        urls: Vec<String>,
        instances: usize,
        cwd: PathBuf,
        includes: Option<String>,
    ) -> ActionFuture<String, ModuleError> {
        let runtime = Arc::clone(self);
        BlockingActionRunner::spawn(move || {
            WorkerThreadGuard::mark_current_thread();
            let handle = tokio::runtime::Handle::current();
            handle.block_on(runtime.deploy_verticle_blocking(dep_name, worker, main, urls, instances, cwd, includes))
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn deploy_verticle_blocking(
        self: Arc<Self>,
        dep_name: Option<String>,
        worker: bool,
        main: String,
        mut urls: Vec<String>,
        instances: usize,
        cwd: PathBuf,
        includes: Option<String>,
    ) -> ModuleResult<String> {
        require_worker_thread()?;

        if let Some(includes) = includes {
            for module in includes.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let deps = self.resolver.resolve(module).await;
                for url in deps.urls {
                    if !urls.contains(&url) {
                        urls.push(url);
                    }
                }
            }
        }

        let factory = self.factories.resolve(&main);
        let name = dep_name.unwrap_or_else(|| Uuid::new_v4().to_string());
        let config = ModuleConfig::from_json(&format!(
            r#"{{"main":{main:?},"worker":{worker}}}"#
        ))?;

        self.tree.deploy(&name, "", instances, config.clone(), urls.clone(), cwd.clone(), false, None)?;

        let shared_loader_id = Uuid::new_v4();
        let mut tasks = Vec::with_capacity(instances);
        for _ in 0..instances {
            let factory = factory.clone();
            let main = main.clone();
            let ctx = ExecutionContext {
                deployment_name: name.clone(),
                module_name: String::new(),
                urls: urls.clone(),
                cwd: cwd.clone(),
                worker,
                loader_id: if worker { shared_loader_id } else { Uuid::new_v4() },
            };
            tasks.push(tokio::task::spawn_blocking(move || {
                let result = factory.create_verticle(&main).and_then(|mut v| {
                    v.start(&ctx)?;
                    Ok(v)
                });
                (ctx, result)
            }));
        }

        let mut holders = Vec::with_capacity(instances);
        let mut any_failed = false;
        for task in tasks {
            match task.await {
                Ok((ctx, Ok(verticle))) => holders.push(Arc::new(VerticleHolder {
                    execution_context: ctx,
                    verticle: Mutex::new(verticle),
                })),
                Ok((_, Err(e))) => {
                    warn!(deployment = %name, error = %e, "ad-hoc verticle instance failed to start");
                    any_failed = true;
                }
                Err(join_err) => {
                    warn!(deployment = %name, error = %join_err, "instance launch task panicked");
                    any_failed = true;
                }
            }
        }

        // Registered before the failure check, same reasoning as
        // `deploy_module_blocking`: `undeploy_blocking` needs to find
        // these to `stop()` them.
        self.holders.insert(name.clone(), holders);

        if any_failed {
            self.undeploy_blocking(&name)?;
            return Err(ModuleError::StartFailed(name));
        }

        Ok(name)
    }

    /// Undeploys `name` and its subtree, depth-first, stopping every
    /// instance before its slot in the tree is cleared (spec.md §4.8
    /// `undeploy`).
    pub fn undeploy(self: &Arc<Self>, name: &str) -> ActionFuture<Vec<String>, ModuleError> {
        let runtime = Arc::clone(self);
        let name = name.to_string();
        BlockingActionRunner::spawn(move || {
            WorkerThreadGuard::mark_current_thread();
            runtime.undeploy_blocking(&name)
        })
    }

    fn undeploy_blocking(&self, name: &str) -> ModuleResult<Vec<String>> {
        require_worker_thread()?;
        let removed = self.tree.undeploy(name)?;
        let mut order = Vec::with_capacity(removed.len());
        for dep in &removed {
            if let Some((_, holders)) = self.holders.remove(&dep.name) {
                for holder in &holders {
                    if let Ok(mut verticle) = holder.verticle.lock() {
                        if let Err(e) = verticle.stop(&holder.execution_context) {
                            warn!(deployment = %dep.name, error = %e, "verticle stop failed");
                        }
                    }
                }
            }
            self.notify_undeployed(dep);
            order.push(dep.name.clone());
        }
        Ok(order)
    }

    /// Re-deploys a set of already-redeployed-eligible deployments using
    /// their recorded module name, config, and instance count (spec.md
    /// §4.8 `reload`). Skips any name no longer present in the tree.
    fn reload_one(self: &Arc<Self>, dep: Deployment) {
        if !self.tree.contains(&dep.name) {
            return;
        }
        info!(deployment = %dep.name, module = %dep.module_name, "reloading deployment");
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let undeployed = runtime.undeploy(&dep.name).await_result(std::time::Duration::from_secs(30));
            if let crate::action::ActionOutcome::Err(e) = &undeployed {
                warn!(deployment = %dep.name, error = %e, "undeploy during reload failed, skipping redeploy");
                return;
            }
            let redeployed = runtime
                .deploy_module(Some(dep.name.clone()), dep.module_name.clone(), dep.instance_count, None, dep.parent.clone())
                .await_result(std::time::Duration::from_secs(30));
            match redeployed {
                crate::action::ActionOutcome::Ok(name) => info!(deployment = %name, "redeploy completed"),
                other => warn!(deployment = %dep.name, outcome = ?other, "redeploy did not complete cleanly"),
            }
        });
    }
}

impl Reloader for VerticleRuntime {
    fn reload_modules(&self, deployments: Vec<Deployment>) {
        let Some(strong) = self.self_weak.get().and_then(Weak::upgrade) else {
            warn!("reload requested after runtime was dropped");
            return;
        };
        for dep in deployments {
            strong.reload_one(dep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::RepositoryList;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn write_module(root: &Path, name: &str, manifest: &str) {
        let dir = module_dir(root, name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("mod.json"), manifest).unwrap();
    }

    fn runtime_over(root: &Path) -> Arc<VerticleRuntime> {
        let resolver = ModuleResolver::new(root.to_path_buf(), RepositoryList::empty());
        let tree = Arc::new(DeploymentTree::new());
        let factories = FactoryRegistry::with_builtin_defaults();
        VerticleRuntime::new(resolver, tree, factories)
    }

    #[tokio::test]
    async fn deploy_module_without_main_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        write_module(root.path(), "lib-only", r#"{}"#);
        let runtime = runtime_over(root.path());

        let future = runtime.deploy_module(None, "lib-only".to_string(), 1, None, None);
        let outcome = future.await_result(Duration::from_secs(5));
        assert!(matches!(outcome, crate::action::ActionOutcome::Err(ModuleError::NotRunnable(_))));
    }

    #[tokio::test]
    async fn deploy_module_launches_instances_and_registers_in_tree() {
        let root = tempfile::tempdir().unwrap();
        write_module(root.path(), "my-mod", r#"{"main":"app.js"}"#);
        let runtime = runtime_over(root.path());

        let future = runtime.deploy_module(Some("dep1".to_string()), "my-mod".to_string(), 3, None, None);
        let outcome = future.await_result(Duration::from_secs(5));
        assert_eq!(outcome, crate::action::ActionOutcome::Ok("dep1".to_string()));

        let dep = runtime.tree().get("dep1").unwrap();
        assert_eq!(dep.instance_count, 3);
        assert_eq!(dep.module_name, "my-mod");
    }

    #[tokio::test]
    async fn undeploy_stops_every_instance_and_clears_the_tree() {
        let root = tempfile::tempdir().unwrap();
        write_module(root.path(), "my-mod", r#"{"main":"app.js"}"#);
        let runtime = runtime_over(root.path());

        runtime
            .deploy_module(Some("dep1".to_string()), "my-mod".to_string(), 2, None, None)
            .await_result(Duration::from_secs(5));

        let outcome = runtime.undeploy("dep1").await_result(Duration::from_secs(5));
        assert_eq!(outcome, crate::action::ActionOutcome::Ok(vec!["dep1".to_string()]));
        assert!(!runtime.tree().contains("dep1"));
    }

    #[tokio::test]
    async fn partial_start_failure_still_stops_the_instances_that_did_start() {
        use crate::factory::LanguageFactory;

        struct FlakyVerticle {
            stop_count: Arc<AtomicUsize>,
        }
        impl Verticle for FlakyVerticle {
            fn start(&mut self, _ctx: &ExecutionContext) -> ModuleResult<()> {
                Ok(())
            }
            fn stop(&mut self, _ctx: &ExecutionContext) -> ModuleResult<()> {
                self.stop_count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
        struct DoomedVerticle;
        impl Verticle for DoomedVerticle {
            fn start(&mut self, _ctx: &ExecutionContext) -> ModuleResult<()> {
                Err(ModuleError::StartFailed("doomed instance".to_string()))
            }
            fn stop(&mut self, _ctx: &ExecutionContext) -> ModuleResult<()> {
                Ok(())
            }
        }
        struct FlakyFactory {
            calls: AtomicUsize,
            stop_count: Arc<AtomicUsize>,
        }
        impl LanguageFactory for FlakyFactory {
            fn create_verticle(&self, _main: &str) -> ModuleResult<Box<dyn Verticle>> {
                let idx = self.calls.fetch_add(1, Ordering::SeqCst);
                if idx == 0 {
                    Ok(Box::new(FlakyVerticle { stop_count: Arc::clone(&self.stop_count) }))
                } else {
                    Ok(Box::new(DoomedVerticle))
                }
            }
        }

        let root = tempfile::tempdir().unwrap();
        write_module(root.path(), "flaky-mod", r#"{"main":"app.flaky"}"#);

        let resolver = ModuleResolver::new(root.path().to_path_buf(), RepositoryList::empty());
        let tree = Arc::new(DeploymentTree::new());
        let stop_count = Arc::new(AtomicUsize::new(0));
        let mut factories = FactoryRegistry::with_builtin_defaults();
        factories.register("flaky", Arc::new(FlakyFactory { calls: AtomicUsize::new(0), stop_count: Arc::clone(&stop_count) }));
        let runtime = VerticleRuntime::new(resolver, tree, factories);

        let outcome = runtime
            .deploy_module(Some("dep1".to_string()), "flaky-mod".to_string(), 2, None, None)
            .await_result(Duration::from_secs(5));

        assert!(matches!(outcome, crate::action::ActionOutcome::Err(ModuleError::StartFailed(_))));
        assert_eq!(
            stop_count.load(Ordering::SeqCst),
            1,
            "the instance that did start must have stop() called during the automatic undeploy"
        );
        assert!(!runtime.tree().contains("dep1"));
    }

    #[tokio::test]
    async fn redeploy_observer_is_notified_only_for_auto_redeploy_modules() {
        let root = tempfile::tempdir().unwrap();
        write_module(root.path(), "watched", r#"{"main":"app.js","auto-redeploy":true}"#);
        write_module(root.path(), "plain", r#"{"main":"app.js"}"#);
        let runtime = runtime_over(root.path());

        struct Counting {
            deployed: AtomicUsize,
            undeployed: AtomicUsize,
        }
        impl RedeployObserver for Counting {
            fn module_deployed(&self, _module_name: &str, _mod_dir: &Path, _deployment_name: &str) {
                self.deployed.fetch_add(1, Ordering::SeqCst);
            }
            fn module_undeployed(&self, _deployment_name: &str) {
                self.undeployed.fetch_add(1, Ordering::SeqCst);
            }
        }
        let observer = Arc::new(Counting {
            deployed: AtomicUsize::new(0),
            undeployed: AtomicUsize::new(0),
        });
        runtime.set_redeploy_observer(observer.clone());

        runtime
            .deploy_module(Some("watched-dep".to_string()), "watched".to_string(), 1, None, None)
            .await_result(Duration::from_secs(5));
        runtime
            .deploy_module(Some("plain-dep".to_string()), "plain".to_string(), 1, None, None)
            .await_result(Duration::from_secs(5));

        assert_eq!(observer.deployed.load(Ordering::SeqCst), 1);

        runtime.undeploy("watched-dep").await_result(Duration::from_secs(5));
        runtime.undeploy("plain-dep").await_result(Duration::from_secs(5));

        assert_eq!(observer.undeployed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deploying_outside_the_worker_pool_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        write_module(root.path(), "my-mod", r#"{"main":"app.js"}"#);
        let runtime = runtime_over(root.path());

        let err = runtime
            .deploy_module_blocking(None, "my-mod".to_string(), 1, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::NotOnWorkerThread(_)));
    }
}
