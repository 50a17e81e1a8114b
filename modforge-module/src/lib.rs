//! Module manifest parsing, dependency resolution, the deployment tree,
//! and the verticle runtime for the modforge platform.
//!
//! Out of scope here, by design (spec.md §1): the language-factory
//! loader that would produce a real polyglot verticle, a networked
//! module repository, and anything touching cluster-wide deployment.
//! `factory::FactoryRegistry` and `repository::FsModuleRepository` are
//! concrete stand-ins good enough to exercise the rest of this crate
//! end to end.

pub mod action;
pub mod config;
pub mod error;
pub mod factory;
pub mod repository;
pub mod resolver;
pub mod runtime;
pub mod tree;

pub use action::{ActionCompleter, ActionFuture, ActionOutcome, BlockingActionRunner, CountingCompletionHandler};
pub use config::{module_dir, module_root, ModuleConfig};
pub use error::{ModuleError, ModuleResult};
pub use factory::{ExecutionContext, FactoryRegistry, InertFactory, InertVerticle, LanguageFactory, Verticle};
pub use repository::{FsModuleRepository, ModuleRepository, RepositoryList};
pub use resolver::{ModuleDependencies, ModuleResolver};
pub use runtime::{Reloader, RedeployObserver, VerticleHolder, VerticleRuntime, WorkerThreadGuard};
pub use tree::{Deployment, DeploymentTree};
