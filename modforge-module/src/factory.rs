use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::ModuleResult;

/// Per-instance handle back into the runtime: the deployment it belongs
/// to, the resolved classpath, and the effective working directory
/// (spec.md §4.8 step 3). `loader_id` stands in for the per-instance
/// class/namespace loader spec.md describes: worker modules share one
/// id across every instance (so static/singleton state is shared, per
/// the original's class-loader-per-verticle design note), non-workers
/// get a distinct id each.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub deployment_name: String,
    pub module_name: String,
    pub urls: Vec<String>,
    pub cwd: PathBuf,
    pub worker: bool,
    pub loader_id: Uuid,
}

/// A single running instance of deployable user code. Lifecycle hooks
/// mirror the glossary: `start`/`stop`.
pub trait Verticle: Send {
    fn start(&mut self, ctx: &ExecutionContext) -> ModuleResult<()>;
    fn stop(&mut self, ctx: &ExecutionContext) -> ModuleResult<()>;
}

/// Instantiates a `Verticle` from a module's `main` entry point. Stands
/// in for spec.md's out-of-scope "language-factory loader": concrete
/// enough for `VerticleRuntime::deploy_module` to produce something
/// real and testable, without claiming to load an actual scripting
/// runtime.
pub trait LanguageFactory: Send + Sync {
    fn create_verticle(&self, main: &str) -> ModuleResult<Box<dyn Verticle>>;
}

/// A verticle whose `main` never actually executes anything — the
/// trivial stand-in every built-in factory produces. Real per-language
/// loaders are out of scope; this just exercises the lifecycle.
pub struct InertVerticle {
    pub main: String,
}

impl Verticle for InertVerticle {
    fn start(&mut self, _ctx: &ExecutionContext) -> ModuleResult<()> {
        Ok(())
    }

    fn stop(&mut self, _ctx: &ExecutionContext) -> ModuleResult<()> {
        Ok(())
    }
}

/// The built-in default factory, also registered under the `.js`
/// extension since no real JavaScript runtime is in scope here.
pub struct InertFactory;

impl LanguageFactory for InertFactory {
    fn create_verticle(&self, main: &str) -> ModuleResult<Box<dyn Verticle>> {
        Ok(Box::new(InertVerticle {
            main: main.to_string(),
        }))
    }
}

/// Extension -> factory lookup, falling back to a `default` factory
/// (spec.md §4.8 step 4: "by extension of main, else default; from a
/// `langs` property map").
pub struct FactoryRegistry {
    default: Arc<dyn LanguageFactory>,
    by_extension: HashMap<String, Arc<dyn LanguageFactory>>,
}

impl FactoryRegistry {
    pub fn new(default: Arc<dyn LanguageFactory>) -> Self {
        FactoryRegistry {
            default,
            by_extension: HashMap::new(),
        }
    }

    /// The registry spec.md expects out of the box: `.js` mapped to the
    /// same inert default, since a real JS loader is out of scope.
    pub fn with_builtin_defaults() -> Self {
        let default: Arc<dyn LanguageFactory> = Arc::new(InertFactory);
        let mut registry = FactoryRegistry::new(default.clone());
        registry.register("js", default);
        registry
    }

    pub fn register(&mut self, extension: &str, factory: Arc<dyn LanguageFactory>) {
        self.by_extension.insert(extension.trim_start_matches('.').to_string(), factory);
    }

    /// Resolves by the extension of `main`; falls back to `default` if
    /// there's no extension or no registered factory for it.
    pub fn resolve(&self, main: &str) -> Arc<dyn LanguageFactory> {
        let extension = std::path::Path::new(main)
            .extension()
            .and_then(|e| e.to_str());

        match extension.and_then(|ext| self.by_extension.get(ext)) {
            Some(factory) => factory.clone(),
            None => self.default.clone(),
        }
    }
}
