use std::{
    future::Future,
    path::{Path, PathBuf},
};

use anyhow::Result;
use tokio::runtime::RuntimeFlavor;

use crate::{
    async_defer,
    error::FailureClass,
    fs::mount,
    system::{in_root, ExecOutput, Invocation, System, SystemExt as _},
};

/// Host trees bind-mounted into the target, in mount order. `true` means recursive.
const BIND_MOUNTS: [(&str, bool); 3] = [("/proc", false), ("/sys", true), ("/dev", true)];

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Runs commands inside the installed system. Only handed out by [`with_chroot`] while the
/// host's kernel interfaces are visible below the root.
#[derive(Clone, Copy)]
pub struct Chroot<'a> {
    system: &'a dyn System,
    root: &'a Path,
}

impl<'a> Chroot<'a> {
    pub fn root(&self) -> &'a Path {
        self.root
    }

    pub fn system(&self) -> &'a dyn System {
        self.system
    }

    /// The host path of `path` inside the installed system.
    pub fn host_path(&self, path: impl AsRef<Path>) -> PathBuf {
        in_root(self.root, path)
    }

    pub fn wrap(&self, invocation: Invocation) -> Invocation {
        invocation.wrapped_by("chroot", [self.root])
    }

    pub async fn output(&self, invocation: Invocation) -> Result<ExecOutput> {
        self.system.output(&self.wrap(invocation)).await
    }

    pub async fn run(&self, invocation: Invocation) -> Result<Vec<u8>> {
        self.system.run(self.wrap(invocation)).await
    }

    pub async fn run_best_effort(&self, invocation: Invocation) -> bool {
        self.system.run_best_effort(self.wrap(invocation)).await
    }
}

async fn setup(system: &dyn System, root: &Path, mounted: &mut Vec<PathBuf>) -> Result<()> {
    for (source, recursive) in BIND_MOUNTS {
        let target = in_root(root, source);
        system.create_dir_all(&target).await?;
        mount::bind(system, Path::new(source), &target, recursive).await?;
        mounted.push(target);
    }

    let resolv_conf = in_root(root, RESOLV_CONF);
    if let Err(error) = system.copy(Path::new(RESOLV_CONF), &resolv_conf).await {
        tracing::debug!("Name resolution may not work inside the chroot: {error:#}");
    }
    Ok(())
}

async fn teardown(system: &dyn System, mounted: Vec<PathBuf>) {
    for target in mounted.into_iter().rev() {
        if !mount::umount_recursive_best_effort(system, &target).await {
            tracing::warn!("Failed to umount {target:?}, it may still be mounted");
        }
    }
}

/// The bind mounts made so far. Whatever is still recorded when this is dropped, because the
/// future holding it was cancelled, gets unmounted from `Drop`.
struct BindMounts<'a> {
    system: &'a dyn System,
    mounted: Vec<PathBuf>,
}

impl BindMounts<'_> {
    async fn release(&mut self) {
        teardown(self.system, std::mem::take(&mut self.mounted)).await;
    }
}

impl Drop for BindMounts<'_> {
    fn drop(&mut self) {
        if self.mounted.is_empty() {
            return;
        }
        let system = self.system;
        let mounted = std::mem::take(&mut self.mounted);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tracing::warn!("Chroot task was interrupted, unmounting {mounted:?}");
                async_defer!(teardown(system, mounted));
            }
            _ => tracing::warn!("Chroot task was interrupted, {mounted:?} may still be mounted"),
        }
    }
}

/// Run `f` against the target root with /proc, /sys and /dev visible inside it. The bind
/// mounts are torn down again whether `f` succeeds, fails or is dropped half way.
pub async fn with_chroot<'a, F, Fut, T>(system: &'a dyn System, root: &'a Path, f: F) -> Result<T>
where
    F: FnOnce(Chroot<'a>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut mounts = BindMounts {
        system,
        mounted: vec![],
    };
    if let Err(error) = setup(system, root, &mut mounts.mounted).await {
        mounts.release().await;
        return Err(error
            .context(format!("Failed to prepare chroot at {root:?}"))
            .context(FailureClass::Provisioning));
    }

    let result = f(Chroot { system, root }).await;
    mounts.release().await;
    result
}
