use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use modforge_module::{Deployment, DeploymentTree, Reloader, RedeployObserver};
use modforge_timer::{Timer, TimeoutHandle};
use tracing::{info, warn};

use crate::error::{RedeployError, RedeployResult};

/// Wheel tick rate for the redeployer's own [`Timer`]: coarse enough
/// that the scan itself costs nothing between ticks, fine enough that
/// the periodic scan's `check_period` lands within one tick of when it
/// was armed (spec.md §4.2's "approximate, within one tick" contract).
const SCAN_TIMER_TICK: Duration = Duration::from_millis(100);
const SCAN_TIMER_CAPACITY: usize = 64;

struct PollingState {
    dir: PathBuf,
    refs: HashSet<String>,
    last_mtime: Option<SystemTime>,
    dirty: bool,
    probe_failed: bool,
}

/// Redeployer for platforms where a native filesystem watch isn't
/// available: walks each watched module directory on a fixed interval
/// and compares the latest modification time it finds against the
/// previous scan (spec.md §4.9, "polling fallback" — "a periodic timer
/// (2s) scans each registered directory tree"). The scan itself is
/// driven by a [`modforge_timer::Timer`] periodic task rather than a
/// bespoke interval loop, the same hashed-wheel core that underpins the
/// rest of the runtime's scheduling (spec.md §1/§2: redeploy scanning
/// is one of the HWT's stated drivers). Per the recorded resolution for
/// the open question on probe semantics, every cycle also re-`stat`s
/// the module directory itself; a failing probe (the directory having
/// been removed) is treated as a change in its own right rather than
/// silently skipped.
pub struct PollingRedeployer {
    modules: Arc<Mutex<HashMap<String, PollingState>>>,
    dep_to_module: Arc<Mutex<HashMap<String, String>>>,
    closed: Arc<AtomicBool>,
    timer: Mutex<Option<Timer>>,
}

impl PollingRedeployer {
    /// `rt_handle` is the Tokio runtime the reload itself is dispatched
    /// onto: the scan runs on the timer's own dedicated OS thread (it
    /// never assumes an async context, matching `TimerWorker`'s
    /// single-owner-thread rule), but `Reloader::reload_modules` nests a
    /// `tokio::spawn` internally, so firing it has to happen on a thread
    /// the runtime recognizes as its own — the same reasoning
    /// `NativeWatcherRedeployer` follows.
    pub fn new(
        reloader: Arc<dyn Reloader>,
        tree: Arc<DeploymentTree>,
        check_period: Duration,
        rt_handle: tokio::runtime::Handle,
    ) -> RedeployResult<Arc<Self>> {
        let timer = Timer::start(SCAN_TIMER_TICK, SCAN_TIMER_CAPACITY)?;

        let modules: Arc<Mutex<HashMap<String, PollingState>>> = Arc::new(Mutex::new(HashMap::new()));
        let dep_to_module = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let task_modules = Arc::clone(&modules);
        timer.periodic(check_period, move |_h: TimeoutHandle| {
            let to_fire = scan_once(&task_modules);
            for module_name in to_fire {
                let deployments: Vec<Deployment> = tree.deployments_for_module(&module_name);
                if !deployments.is_empty() {
                    info!(module = %module_name, count = deployments.len(), "poll detected a change, reloading bound deployments");
                    let reloader = Arc::clone(&reloader);
                    rt_handle.spawn(async move { reloader.reload_modules(deployments) });
                }
            }
        });

        Ok(Arc::new(PollingRedeployer {
            modules,
            dep_to_module,
            closed,
            timer: Mutex::new(Some(timer)),
        }))
    }

    pub fn close(&self) -> RedeployResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(RedeployError::AlreadyClosed);
        }
        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.stop()?;
        }
        Ok(())
    }
}

impl RedeployObserver for PollingRedeployer {
    fn module_deployed(&self, module_name: &str, mod_dir: &Path, deployment_name: &str) {
        let mut modules = self.modules.lock().unwrap();
        match modules.get_mut(module_name) {
            Some(state) => {
                state.refs.insert(deployment_name.to_string());
            }
            None => {
                let mut refs = HashSet::new();
                refs.insert(deployment_name.to_string());
                modules.insert(
                    module_name.to_string(),
                    PollingState {
                        dir: mod_dir.to_path_buf(),
                        refs,
                        last_mtime: None,
                        dirty: false,
                        probe_failed: false,
                    },
                );
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
        if let Some(state) = modules.get_mut(&module_name) {
            state.refs.remove(deployment_name);
            if state.refs.is_empty() {
                modules.remove(&module_name);
            }
        }
    }
}

fn scan_once(modules: &Mutex<HashMap<String, PollingState>>) -> Vec<String> {
    let mut guard = modules.lock().unwrap();
    let mut to_fire = Vec::new();

    for (module_name, state) in guard.iter_mut() {
        match probe_latest_mtime(&state.dir) {
            Ok(latest) => {
                state.probe_failed = false;
                match state.last_mtime {
                    None => state.last_mtime = Some(latest),
                    Some(prev) if latest > prev => {
                        state.last_mtime = Some(latest);
                        state.dirty = true;
                    }
                    _ => {
                        if state.dirty {
                            state.dirty = false;
                            to_fire.push(module_name.clone());
                        }
                    }
                }
            }
            Err(e) => {
                if !state.probe_failed {
                    state.probe_failed = true;
                    warn!(module = %module_name, error = %e, "module directory probe failed, treating as a change");
                    to_fire.push(module_name.clone());
                }
            }
        }
    }

    to_fire
}

/// Re-stats the directory itself (surfacing deletion) then walks its
/// contents for the newest modification time seen anywhere in the tree.
fn probe_latest_mtime(dir: &Path) -> std::io::Result<SystemTime> {
    let mut latest = std::fs::metadata(dir)?.modified()?;
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if let Ok(modified) = meta.modified() {
                if modified > latest {
                    latest = modified;
                }
            }
            if meta.is_dir() {
                stack.push(entry.path());
            }
        }
    }

    Ok(latest)
}
