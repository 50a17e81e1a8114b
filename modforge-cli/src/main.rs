//! Command-line entry point wiring the timer, module deployment, and
//! redeploy crates into the external surface documented in spec.md §6:
//! `version`, `install`, `uninstall`, `run`, `runmod`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{debug, warn};

use modforge_module::{
    module_dir, module_root, ActionOutcome, FactoryRegistry, FsModuleRepository, ModuleResolver, RedeployObserver, Reloader,
    RepositoryList, VerticleRuntime,
};
use modforge_redeploy::{NativeWatcherRedeployer, DEFAULT_CHECK_PERIOD};

#[derive(Parser)]
#[command(name = "modforge", version, about = "Module deployment runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the version and exit.
    Version,
    /// Install a module from a configured repository, if not already present.
    Install {
        module: String,
        #[arg(long)]
        repo: Option<String>,
    },
    /// Remove an installed module's directory.
    Uninstall { module: String },
    /// Deploy an ad-hoc verticle `main` against an explicit classpath.
    Run(RunArgs),
    /// Deploy a named module's `main` entry point.
    Runmod(RunModArgs),
}

#[derive(Args)]
struct RunArgs {
    main: String,
    #[arg(long)]
    conf: Option<PathBuf>,
    /// Comma-separated classpath entries, in addition to anything pulled in via `--includes`.
    #[arg(long = "cp")]
    cp: Option<String>,
    #[arg(long, default_value_t = 1)]
    instances: usize,
    /// Comma-separated module names to resolve onto the classpath.
    #[arg(long)]
    includes: Option<String>,
    #[arg(long)]
    worker: bool,
    #[arg(long)]
    cluster: bool,
    #[arg(long = "cluster-port")]
    cluster_port: Option<u16>,
    #[arg(long = "cluster-host")]
    cluster_host: Option<String>,
    #[arg(long)]
    repo: Option<String>,
}

#[derive(Args)]
struct RunModArgs {
    module: String,
    #[arg(long)]
    conf: Option<PathBuf>,
    #[arg(long, default_value_t = 1)]
    instances: usize,
    #[arg(long)]
    cluster: bool,
    #[arg(long = "cluster-port")]
    cluster_port: Option<u16>,
    #[arg(long = "cluster-host")]
    cluster_host: Option<String>,
    #[arg(long)]
    repo: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Version => {
            println!("modforge {}", env!("CARGO_PKG_VERSION"));
        }
        Command::Install { module, repo } => cmd_install(&module, repo).await?,
        Command::Uninstall { module } => cmd_uninstall(&module)?,
        Command::Run(args) => cmd_run(args).await?,
        Command::Runmod(args) => cmd_runmod(args).await?,
    }

    Ok(())
}

fn repository_list(repo: Option<&str>) -> RepositoryList {
    match repo {
        Some(url) => RepositoryList::new(vec![Box::new(FsModuleRepository::new("cli-repo", PathBuf::from(url)))]),
        None => RepositoryList::empty(),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn note_conf_file(conf: &Option<PathBuf>) {
    let Some(path) = conf else { return };
    match std::fs::read_to_string(path) {
        Ok(contents) => debug!(path = ?path, bytes = contents.len(), "configuration file read"),
        Err(e) => warn!(path = ?path, error = %e, "failed to read --conf file"),
    }
}

fn warn_if_clustering_requested(cluster: bool, port: Option<u16>, host: Option<String>) {
    if cluster || port.is_some() || host.is_some() {
        warn!(port = ?port, host = ?host, "clustering flags accepted but ignored: cross-host distributed deployment is out of scope");
    }
}

async fn cmd_install(module: &str, repo: Option<String>) -> anyhow::Result<()> {
    let resolver = ModuleResolver::new(module_root(), repository_list(repo.as_deref()));
    if resolver.install(module).await {
        println!("installed '{module}'");
        Ok(())
    } else {
        anyhow::bail!("no repository could provide module '{module}'")
    }
}

fn cmd_uninstall(module: &str) -> anyhow::Result<()> {
    let dir = module_dir(&module_root(), module);
    if !dir.exists() {
        anyhow::bail!("module '{module}' is not installed");
    }
    std::fs::remove_dir_all(&dir)?;
    println!("uninstalled '{module}'");
    Ok(())
}

fn build_runtime(repo: Option<String>) -> Arc<VerticleRuntime> {
    let resolver = ModuleResolver::new(module_root(), repository_list(repo.as_deref()));
    let tree = Arc::new(modforge_module::DeploymentTree::new());
    let factories = FactoryRegistry::with_builtin_defaults();
    VerticleRuntime::new(resolver, tree, factories)
}

/// Starts a native-watcher redeployer bound to `runtime`'s deployment
/// tree. A module's directory is only ever watched once a deployment
/// with `auto-redeploy: true` registers against it (spec.md §4.9).
fn wire_redeployer(runtime: &Arc<VerticleRuntime>) -> anyhow::Result<Arc<NativeWatcherRedeployer>> {
    let reloader: Arc<dyn Reloader> = Arc::clone(runtime);
    let redeployer = NativeWatcherRedeployer::new(reloader, runtime.tree_handle(), DEFAULT_CHECK_PERIOD, tokio::runtime::Handle::current())?;
    runtime.set_redeploy_observer(Arc::clone(&redeployer) as Arc<dyn RedeployObserver>);
    Ok(redeployer)
}

async fn await_action<T, E>(future: modforge_module::ActionFuture<T, E>) -> ActionOutcome<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    tokio::task::spawn_blocking(move || future.await_result(Duration::from_secs(30)))
        .await
        .expect("await_result task panicked")
}

async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c, shutting down immediately");
    }
}

async fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    warn_if_clustering_requested(args.cluster, args.cluster_port, args.cluster_host.clone());
    note_conf_file(&args.conf);

    let runtime = build_runtime(args.repo.clone());
    let redeployer = wire_redeployer(&runtime)?;

    let cwd = std::env::current_dir()?;
    let cp_urls = args.cp.as_deref().map(split_list).unwrap_or_default();

    let deploy = runtime.deploy_verticle(None, args.worker, args.main.clone(), cp_urls, args.instances, cwd, args.includes.clone());

    match await_action(deploy).await {
        ActionOutcome::Ok(name) => {
            println!("deployed '{name}'");
            wait_for_shutdown().await;
            let _ = await_action(runtime.undeploy(&name)).await;
        }
        ActionOutcome::Err(e) => {
            let _ = redeployer.close();
            anyhow::bail!("deploy failed: {e}");
        }
        other => {
            let _ = redeployer.close();
            anyhow::bail!("deploy did not complete: {other:?}");
        }
    }

    let _ = redeployer.close();
    Ok(())
}

async fn cmd_runmod(args: RunModArgs) -> anyhow::Result<()> {
    warn_if_clustering_requested(args.cluster, args.cluster_port, args.cluster_host.clone());
    note_conf_file(&args.conf);

    let runtime = build_runtime(args.repo.clone());
    let redeployer = wire_redeployer(&runtime)?;

    let deploy = runtime.deploy_module(None, args.module.clone(), args.instances, None, None);

    match await_action(deploy).await {
        ActionOutcome::Ok(name) => {
            println!("deployed '{name}'");
            wait_for_shutdown().await;
            let _ = await_action(runtime.undeploy(&name)).await;
        }
        ActionOutcome::Err(e) => {
            let _ = redeployer.close();
            anyhow::bail!("deploy failed: {e}");
        }
        other => {
            let _ = redeployer.close();
            anyhow::bail!("deploy did not complete: {other:?}");
        }
    }

    let _ = redeployer.close();
    Ok(())
}
