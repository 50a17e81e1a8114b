use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use modforge_module::{Deployment, DeploymentTree, ModuleConfig, RedeployObserver, Reloader};
use modforge_redeploy::NativeWatcherRedeployer;

struct RecordingReloader {
    calls: Mutex<Vec<Vec<String>>>,
    count: AtomicUsize,
}

impl RecordingReloader {
    fn new() -> Self {
        RecordingReloader { calls: Mutex::new(Vec::new()), count: AtomicUsize::new(0) }
    }

    fn wait_for_calls(&self, at_least: usize, deadline: Duration) {
        let start = Instant::now();
        while self.count.load(Ordering::SeqCst) < at_least && start.elapsed() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Reloader for RecordingReloader {
    fn reload_modules(&self, deployments: Vec<Deployment>) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(deployments.into_iter().map(|d| d.name).collect());
    }
}

fn auto_redeploy_config() -> ModuleConfig {
    ModuleConfig::from_json(r#"{"main":"foo.js","auto-redeploy":true}"#).unwrap()
}

// S4: a file create under a deployed module's directory, after the
// watcher has gone quiet once, triggers a reload of the bound
// deployment within two CHECK_PERIODs.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s4_file_create_triggers_reload() {
    let mod_dir = tempfile::tempdir().unwrap();
    std::fs::write(mod_dir.path().join("foo.js"), "// entrypoint").unwrap();

    let tree = Arc::new(DeploymentTree::new());
    tree.deploy("dep1", "my-mod", 1, auto_redeploy_config(), Vec::new(), mod_dir.path().to_path_buf(), true, None)
        .unwrap();

    let check_period = Duration::from_millis(100);
    let reloader = Arc::new(RecordingReloader::new());
    let redeployer = NativeWatcherRedeployer::new(
        Arc::clone(&reloader) as Arc<dyn Reloader>,
        Arc::clone(&tree),
        check_period,
        tokio::runtime::Handle::current(),
    )
    .unwrap();

    redeployer.module_deployed("my-mod", mod_dir.path(), "dep1");

    // Wait a full CHECK_PERIOD with nothing happening first, per S4.
    tokio::time::sleep(check_period).await;

    let mut payload = Vec::with_capacity(1000);
    payload.resize(1000, b'x');
    std::fs::write(mod_dir.path().join("blah.txt"), &payload).unwrap();

    reloader.wait_for_calls(1, check_period * 2 + Duration::from_secs(3));

    assert_eq!(reloader.count.load(Ordering::SeqCst), 1);
    assert_eq!(reloader.calls.lock().unwrap()[0], vec!["dep1".to_string()]);

    redeployer.close().unwrap();
}

// S5: two deployments on the same module both reload; a third
// deployment bound to a different module is left untouched.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s5_multi_dep_reload_does_not_touch_unrelated_module() {
    let my_mod_dir = tempfile::tempdir().unwrap();
    let other_mod_dir = tempfile::tempdir().unwrap();
    std::fs::write(my_mod_dir.path().join("foo.js"), "// entrypoint").unwrap();
    std::fs::write(other_mod_dir.path().join("foo.js"), "// entrypoint").unwrap();

    let tree = Arc::new(DeploymentTree::new());
    tree.deploy("dep1", "my-mod", 1, auto_redeploy_config(), Vec::new(), my_mod_dir.path().to_path_buf(), true, None)
        .unwrap();
    tree.deploy("dep2", "my-mod", 1, auto_redeploy_config(), Vec::new(), my_mod_dir.path().to_path_buf(), true, None)
        .unwrap();
    tree.deploy("dep3", "other-mod", 1, auto_redeploy_config(), Vec::new(), other_mod_dir.path().to_path_buf(), true, None)
        .unwrap();

    let check_period = Duration::from_millis(100);
    let reloader = Arc::new(RecordingReloader::new());
    let redeployer = NativeWatcherRedeployer::new(
        Arc::clone(&reloader) as Arc<dyn Reloader>,
        Arc::clone(&tree),
        check_period,
        tokio::runtime::Handle::current(),
    )
    .unwrap();

    redeployer.module_deployed("my-mod", my_mod_dir.path(), "dep1");
    redeployer.module_deployed("my-mod", my_mod_dir.path(), "dep2");
    redeployer.module_deployed("other-mod", other_mod_dir.path(), "dep3");

    tokio::time::sleep(check_period).await;
    std::fs::write(my_mod_dir.path().join("bar.js"), "changed").unwrap();

    reloader.wait_for_calls(1, check_period * 2 + Duration::from_secs(3));

    assert_eq!(reloader.count.load(Ordering::SeqCst), 1);
    let mut names = reloader.calls.lock().unwrap()[0].clone();
    names.sort();
    assert_eq!(names, vec!["dep1".to_string(), "dep2".to_string()]);

    redeployer.close().unwrap();
}

// Property 8: a burst of several writes to the same module within one
// CHECK_PERIOD collapses into exactly one reload.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn property8_redeployer_coalesces_write_bursts() {
    let mod_dir = tempfile::tempdir().unwrap();
    std::fs::write(mod_dir.path().join("foo.js"), "// entrypoint").unwrap();

    let tree = Arc::new(DeploymentTree::new());
    tree.deploy("dep1", "my-mod", 1, auto_redeploy_config(), Vec::new(), mod_dir.path().to_path_buf(), true, None)
        .unwrap();

    let check_period = Duration::from_millis(150);
    let reloader = Arc::new(RecordingReloader::new());
    let redeployer = NativeWatcherRedeployer::new(
        Arc::clone(&reloader) as Arc<dyn Reloader>,
        Arc::clone(&tree),
        check_period,
        tokio::runtime::Handle::current(),
    )
    .unwrap();

    redeployer.module_deployed("my-mod", mod_dir.path(), "dep1");
    tokio::time::sleep(check_period).await;

    for i in 0..5 {
        std::fs::write(mod_dir.path().join(format!("burst-{i}.txt")), "x").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    reloader.wait_for_calls(1, check_period * 2 + Duration::from_secs(3));
    // Give any further (incorrect) firings a chance to show up before asserting.
    tokio::time::sleep(check_period).await;

    assert_eq!(reloader.count.load(Ordering::SeqCst), 1);

    redeployer.close().unwrap();
}

#[test]
fn module_undeployed_without_a_prior_deploy_is_a_no_op() {
    // Exercises the RedeployObserver contract directly: undeploying a
    // deployment name the engine never saw must not panic.
    struct Noop;
    impl Reloader for Noop {
        fn reload_modules(&self, _deployments: Vec<Deployment>) {}
    }

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let tree = Arc::new(DeploymentTree::new());
        let redeployer = NativeWatcherRedeployer::new(
            Arc::new(Noop) as Arc<dyn Reloader>,
            tree,
            Duration::from_secs(1),
            tokio::runtime::Handle::current(),
        )
        .unwrap();
        redeployer.module_undeployed("never-deployed");
        redeployer.close().unwrap();
    });
}

