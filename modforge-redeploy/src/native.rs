use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use modforge_module::{Deployment, DeploymentTree, Reloader, RedeployObserver};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{info, warn};

use crate::error::{RedeployError, RedeployResult};

struct ModuleWatch {
    dir: PathBuf,
    refs: HashSet<String>,
}

/// Redeployer grounded on the native-watcher debounce loop (notify + a
/// background thread polling a bounded `mpsc::Receiver` on a timeout),
/// the same shape as the teacher's file watcher. A module only starts
/// being watched once the first deployment bound to it is registered,
/// and stops the moment the last one is gone — two deployments sharing
/// a module (spec.md §8 property: "redeployer coalesces bursts") share
/// one underlying `notify` watch.
pub struct NativeWatcherRedeployer {
    watcher: Mutex<RecommendedWatcher>,
    modules: Arc<Mutex<HashMap<String, ModuleWatch>>>,
    dep_to_module: Arc<Mutex<HashMap<String, String>>>,
    closed: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NativeWatcherRedeployer {
    /// `check_period` is the quiescence window: a module's directory must
    /// go this long without a further filesystem event before its bound
    /// deployments are reloaded (spec.md §4.9). `rt_handle` is the Tokio
    /// runtime the reload itself is dispatched onto: the watch loop runs
    /// on its own plain OS thread (matching the teacher's watcher, which
    /// never assumes an async context), but `Reloader::reload_modules`
    /// nests a `tokio::spawn` internally, so firing it has to happen on
    /// a thread the runtime recognizes as its own.
    pub fn new(
        reloader: Arc<dyn Reloader>,
        tree: Arc<DeploymentTree>,
        check_period: Duration,
        rt_handle: tokio::runtime::Handle,
    ) -> RedeployResult<Arc<Self>> {
        let (tx, rx) = mpsc::channel();
        let watcher = RecommendedWatcher::new(tx, notify::Config::default())?;

        let modules: Arc<Mutex<HashMap<String, ModuleWatch>>> = Arc::new(Mutex::new(HashMap::new()));
        let dep_to_module = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let worker_modules = Arc::clone(&modules);
        let worker_closed = Arc::clone(&closed);
        let handle = std::thread::Builder::new()
            .name("modforge-redeploy-native".to_string())
            .spawn(move || run_watch_loop(rx, worker_modules, tree, reloader, check_period, worker_closed, rt_handle))
            .expect("failed to spawn native redeploy watcher thread");

        Ok(Arc::new(NativeWatcherRedeployer {
            watcher: Mutex::new(watcher),
            modules,
            dep_to_module,
            closed,
            worker: Mutex::new(Some(handle)),
        }))
    }

    /// Stops the background thread and drops every `notify` watch. Safe
    /// to call once; a second call reports `AlreadyClosed` rather than
    /// panicking on a poisoned join.
    pub fn close(&self) -> RedeployResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(RedeployError::AlreadyClosed);
        }
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for NativeWatcherRedeployer {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl RedeployObserver for NativeWatcherRedeployer {
    fn module_deployed(&self, module_name: &str, mod_dir: &Path, deployment_name: &str) {
        let mut modules = self.modules.lock().unwrap();
        match modules.get_mut(module_name) {
            Some(watch) => {
                watch.refs.insert(deployment_name.to_string());
            }
            None => {
                if let Err(e) = self.watcher.lock().unwrap().watch(mod_dir, RecursiveMode::Recursive) {
                    warn!(module = %module_name, path = ?mod_dir, error = %e, "failed to watch module directory");
                    return;
                }
                let mut refs = HashSet::new();
                refs.insert(deployment_name.to_string());
                modules.insert(module_name.to_string(), ModuleWatch { dir: mod_dir.to_path_buf(), refs });
            }
        }
        drop(modules);
        self.dep_to_module.lock().unwrap().insert(deployment_name.to_string(), module_name.to_string());
    }

    fn module_undeployed(&self, deployment_name: &str) {
        let module_name = match self.dep_to_module.lock().unwrap().remove(deployment_name) {
            Some(m) => m,
            None => return,
        };
        let mut modules = self.modules.lock().unwrap();
        if let Some(watch) = modules.get_mut(&module_name) {
            watch.refs.remove(deployment_name);
            if watch.refs.is_empty() {
                let dir = watch.dir.clone();
                modules.remove(&module_name);
                drop(modules);
                if let Err(e) = self.watcher.lock().unwrap().unwatch(&dir) {
                    warn!(module = %module_name, path = ?dir, error = %e, "failed to unwatch module directory");
                }
            }
        }
    }
}

fn module_for_path(modules: &Mutex<HashMap<String, ModuleWatch>>, path: &Path) -> Option<String> {
    modules
        .lock()
        .unwrap()
        .iter()
        .find(|(_, watch)| path.starts_with(&watch.dir))
        .map(|(name, _)| name.clone())
}

fn run_watch_loop(
    rx: mpsc::Receiver<notify::Result<Event>>,
    modules: Arc<Mutex<HashMap<String, ModuleWatch>>>,
    tree: Arc<DeploymentTree>,
    reloader: Arc<dyn Reloader>,
    check_period: Duration,
    closed: Arc<AtomicBool>,
    rt_handle: tokio::runtime::Handle,
) {
    let mut dirty: HashMap<String, Instant> = HashMap::new();

    loop {
        if closed.load(Ordering::SeqCst) {
            return;
        }

        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Ok(event)) => {
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)) {
                    continue;
                }
                for path in &event.paths {
                    if let Some(module_name) = module_for_path(&modules, path) {
                        dirty.insert(module_name, Instant::now());
                    }
                }
            }
            Ok(Err(e)) => warn!(error = %e, "native watcher reported an error"),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }

        fire_quiesced(&mut dirty, check_period, &tree, &reloader, &rt_handle);
    }
}

fn fire_quiesced(
    dirty: &mut HashMap<String, Instant>,
    check_period: Duration,
    tree: &DeploymentTree,
    reloader: &Arc<dyn Reloader>,
    rt_handle: &tokio::runtime::Handle,
) {
    let now = Instant::now();
    let quiesced: Vec<String> = dirty
        .iter()
        .filter(|(_, last_event)| now.duration_since(**last_event) >= check_period)
        .map(|(module_name, _)| module_name.clone())
        .collect();

    for module_name in quiesced {
        dirty.remove(&module_name);
        let deployments: Vec<Deployment> = tree.deployments_for_module(&module_name);
        if !deployments.is_empty() {
            info!(module = %module_name, count = deployments.len(), "module directory quiet, reloading bound deployments");
            let reloader = Arc::clone(reloader);
            rt_handle.spawn(async move { reloader.reload_modules(deployments) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modforge_module::ModuleConfig;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct RecordingReloader {
        calls: StdMutex<Vec<Vec<String>>>,
        count: AtomicUsize,
    }

    impl RecordingReloader {
        fn new() -> Self {
            RecordingReloader { calls: StdMutex::new(Vec::new()), count: AtomicUsize::new(0) }
        }
    }

    impl Reloader for RecordingReloader {
        fn reload_modules(&self, deployments: Vec<Deployment>) {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push(deployments.into_iter().map(|d| d.name).collect());
        }
    }

    fn stub_config() -> ModuleConfig {
        ModuleConfig::from_json(r#"{"main":"app.js","auto-redeploy":true}"#).unwrap()
    }

    #[tokio::test]
    async fn module_deployed_then_undeployed_unwatches_once_refs_drop_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Arc::new(DeploymentTree::new());
        tree.deploy("dep1", "my-mod", 1, stub_config(), Vec::new(), dir.path().to_path_buf(), true, None)
            .unwrap();

        let reloader: Arc<dyn Reloader> = Arc::new(RecordingReloader::new());
        let redeployer =
            NativeWatcherRedeployer::new(reloader, Arc::clone(&tree), Duration::from_millis(50), tokio::runtime::Handle::current())
                .unwrap();

        redeployer.module_deployed("my-mod", dir.path(), "dep1");
        assert!(redeployer.modules.lock().unwrap().contains_key("my-mod"));

        redeployer.module_undeployed("dep1");
        assert!(!redeployer.modules.lock().unwrap().contains_key("my-mod"));

        redeployer.close().unwrap();
    }

    #[tokio::test]
    async fn two_deployments_on_one_module_share_a_single_watch() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Arc::new(DeploymentTree::new());
        tree.deploy("dep1", "shared-mod", 1, stub_config(), Vec::new(), dir.path().to_path_buf(), true, None)
            .unwrap();
        tree.deploy("dep2", "shared-mod", 1, stub_config(), Vec::new(), dir.path().to_path_buf(), true, None)
            .unwrap();

        let reloader: Arc<dyn Reloader> = Arc::new(RecordingReloader::new());
        let redeployer =
            NativeWatcherRedeployer::new(reloader, Arc::clone(&tree), Duration::from_millis(50), tokio::runtime::Handle::current())
                .unwrap();

        redeployer.module_deployed("shared-mod", dir.path(), "dep1");
        redeployer.module_deployed("shared-mod", dir.path(), "dep2");
        assert_eq!(redeployer.modules.lock().unwrap().get("shared-mod").unwrap().refs.len(), 2);

        redeployer.module_undeployed("dep1");
        assert!(redeployer.modules.lock().unwrap().contains_key("shared-mod"));

        redeployer.module_undeployed("dep2");
        assert!(!redeployer.modules.lock().unwrap().contains_key("shared-mod"));

        redeployer.close().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn a_file_create_after_quiescence_triggers_one_reload_for_every_bound_deployment() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Arc::new(DeploymentTree::new());
        tree.deploy("dep1", "watched-mod", 1, stub_config(), Vec::new(), dir.path().to_path_buf(), true, None)
            .unwrap();
        tree.deploy("dep2", "watched-mod", 1, stub_config(), Vec::new(), dir.path().to_path_buf(), true, None)
            .unwrap();

        let reloader = Arc::new(RecordingReloader::new());
        let redeployer = NativeWatcherRedeployer::new(
            Arc::clone(&reloader) as Arc<dyn Reloader>,
            Arc::clone(&tree),
            Duration::from_millis(100),
            tokio::runtime::Handle::current(),
        )
        .unwrap();

        redeployer.module_deployed("watched-mod", dir.path(), "dep1");
        redeployer.module_deployed("watched-mod", dir.path(), "dep2");

        tokio::time::sleep(Duration::from_millis(150)).await;
        std::fs::write(dir.path().join("app.js"), "changed").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while reloader.count.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(reloader.count.load(Ordering::SeqCst), 1);
        let mut names = reloader.calls.lock().unwrap()[0].clone();
        names.sort();
        assert_eq!(names, vec!["dep1".to_string(), "dep2".to_string()]);

        redeployer.close().unwrap();
    }
}
