//! Environment management: package installs and env health.
//!
//! Installs are env mutations and must not interleave with execution in
//! the same env. Each env carries an async rwlock: every run holds a read
//! guard for its full execution, and an install takes the write side, so
//! an install waits for in-flight runs to finish and runs submitted during
//! an install wait for it to complete.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedRwLockReadGuard, RwLock as AsyncRwLock};
use tracing::{info, warn};

use crate::error::{NodeError, Result};

/// Installs packages into a named environment.
///
/// The node is agnostic to what "install" means; deployments plug in a
/// real package manager here. Tests use [`AcceptAll`] or a failing stub.
pub trait PackageInstaller: Send + Sync + 'static {
    /// Install one package into `env`. Returns the installer's traceback
    /// text on failure.
    fn install(&self, package: &str, env: &str) -> std::result::Result<(), String>;
}

/// Installer that accepts every package without doing anything.
#[derive(Default)]
pub struct AcceptAll;

impl PackageInstaller for AcceptAll {
    fn install(&self, _package: &str, _env: &str) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Health of one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvState {
    /// Accepting runs.
    Ready,
    /// An install is in flight; runs wait on the env lock.
    Installing,
    /// A previous install failed. Runs are rejected until a subsequent
    /// successful install repairs the env.
    Broken { package: String, traceback: String },
}

/// Shared hold on an environment, kept for the duration of one run.
/// Installs into the same env wait until every guard is dropped.
pub type EnvGuard = OwnedRwLockReadGuard<()>;

struct EnvEntry {
    state: Mutex<EnvState>,
    lock: Arc<AsyncRwLock<()>>,
}

impl EnvEntry {
    fn new() -> Self {
        Self {
            state: Mutex::new(EnvState::Ready),
            lock: Arc::new(AsyncRwLock::new(())),
        }
    }
}

/// Tracks every named environment on the node.
pub struct EnvManager {
    installer: Arc<dyn PackageInstaller>,
    envs: Mutex<HashMap<String, Arc<EnvEntry>>>,
}

impl EnvManager {
    pub fn new(installer: Arc<dyn PackageInstaller>) -> Self {
        Self {
            installer,
            envs: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, env: &str) -> Arc<EnvEntry> {
        let mut envs = self.envs.lock().unwrap();
        Arc::clone(
            envs.entry(env.to_string())
                .or_insert_with(|| Arc::new(EnvEntry::new())),
        )
    }

    /// Current state of `env`. Unknown envs are Ready by definition.
    pub fn state(&self, env: &str) -> EnvState {
        self.entry(env).state.lock().unwrap().clone()
    }

    /// Install `packages` into `env`, in order, stopping at the first
    /// failure. A failure marks the env Broken; a later successful install
    /// repairs it.
    ///
    /// Waits for every in-flight run in `env` to finish before mutating,
    /// and blocks new runs until it completes. The installer itself runs
    /// on a blocking thread.
    pub async fn install(&self, packages: &[String], env: &str) -> Result<()> {
        let entry = self.entry(env);
        let _held = entry.lock.write().await;
        *entry.state.lock().unwrap() = EnvState::Installing;

        for package in packages {
            info!(package = %package, env = %env, "installing package");
            let installer = Arc::clone(&self.installer);
            let pkg = package.clone();
            let env_name = env.to_string();
            let outcome = tokio::task::spawn_blocking(move || installer.install(&pkg, &env_name))
                .await
                .unwrap_or_else(|e| Err(e.to_string()));
            if let Err(traceback) = outcome {
                warn!(package = %package, env = %env, "install failed");
                *entry.state.lock().unwrap() = EnvState::Broken {
                    package: package.clone(),
                    traceback: traceback.clone(),
                };
                return Err(NodeError::Install {
                    package: package.clone(),
                    env: env.to_string(),
                    traceback,
                });
            }
        }

        *entry.state.lock().unwrap() = EnvState::Ready;
        Ok(())
    }

    /// Wait out any in-flight install on `env`, verify the env is usable,
    /// and take a shared hold on it. The returned guard must live as long
    /// as the run executes; installs wait for it.
    pub async fn begin_run(&self, env: &str) -> Result<EnvGuard> {
        let entry = self.entry(env);
        let guard = Arc::clone(&entry.lock).read_owned().await;
        let state = entry.state.lock().unwrap().clone();
        match state {
            EnvState::Broken { package, traceback } => Err(NodeError::Install {
                package,
                env: env.to_string(),
                traceback,
            }),
            _ => Ok(guard),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RejectNamed(&'static str);

    impl PackageInstaller for RejectNamed {
        fn install(&self, package: &str, _env: &str) -> std::result::Result<(), String> {
            if package == self.0 {
                Err(format!("no such package: {}", package))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn successful_install_leaves_env_ready() {
        let mgr = EnvManager::new(Arc::new(AcceptAll));
        mgr.install(&["numpy".to_string()], "base").await.unwrap();
        assert_eq!(mgr.state("base"), EnvState::Ready);
        let _guard = mgr.begin_run("base").await.unwrap();
    }

    #[tokio::test]
    async fn failed_install_marks_env_broken() {
        let mgr = EnvManager::new(Arc::new(RejectNamed("badpkg")));
        let err = mgr
            .install(&["goodpkg".to_string(), "badpkg".to_string()], "base")
            .await
            .unwrap_err();

        assert!(matches!(err, NodeError::Install { ref package, .. } if package == "badpkg"));
        assert!(matches!(mgr.state("base"), EnvState::Broken { .. }));

        // A run against a broken env is rejected before execution.
        let err = mgr.begin_run("base").await.unwrap_err();
        assert_eq!(err.to_exception().kind, "InstallError");
    }

    #[tokio::test]
    async fn later_successful_install_repairs_env() {
        let mgr = EnvManager::new(Arc::new(RejectNamed("badpkg")));
        let _ = mgr.install(&["badpkg".to_string()], "base").await;
        assert!(matches!(mgr.state("base"), EnvState::Broken { .. }));

        mgr.install(&["goodpkg".to_string()], "base").await.unwrap();
        assert_eq!(mgr.state("base"), EnvState::Ready);
    }

    #[tokio::test]
    async fn unknown_env_is_ready() {
        let mgr = EnvManager::new(Arc::new(AcceptAll));
        assert_eq!(mgr.state("fresh"), EnvState::Ready);
        let _guard = mgr.begin_run("fresh").await.unwrap();
    }

    #[tokio::test]
    async fn envs_are_isolated() {
        let mgr = EnvManager::new(Arc::new(RejectNamed("badpkg")));
        let _ = mgr.install(&["badpkg".to_string()], "a").await;

        assert!(matches!(mgr.state("a"), EnvState::Broken { .. }));
        let _guard = mgr.begin_run("b").await.unwrap();
    }

    #[tokio::test]
    async fn install_waits_for_in_flight_runs() {
        let mgr = Arc::new(EnvManager::new(Arc::new(AcceptAll)));
        let guard = mgr.begin_run("base").await.unwrap();

        // While a run holds the env, an install cannot acquire it.
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            mgr.install(&["numpy".to_string()], "base"),
        )
        .await;
        assert!(blocked.is_err());

        drop(guard);
        mgr.install(&["numpy".to_string()], "base").await.unwrap();
        assert_eq!(mgr.state("base"), EnvState::Ready);
    }

    #[tokio::test]
    async fn runs_wait_for_in_flight_install() {
        struct SlowInstall;
        impl PackageInstaller for SlowInstall {
            fn install(&self, _package: &str, _env: &str) -> std::result::Result<(), String> {
                std::thread::sleep(std::time::Duration::from_millis(100));
                Ok(())
            }
        }

        let mgr = Arc::new(EnvManager::new(Arc::new(SlowInstall)));
        let installer = Arc::clone(&mgr);
        let install = tokio::spawn(async move {
            installer.install(&["numpy".to_string()], "base").await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        // begin_run resolves only after the install releases the env.
        let _guard = mgr.begin_run("base").await.unwrap();
        assert_eq!(mgr.state("base"), EnvState::Ready);
        install.await.unwrap().unwrap();
    }
}
