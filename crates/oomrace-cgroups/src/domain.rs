//! Memory accounting domains on the cgroup v1 memory controller.
//!
//! Each domain is one directory under the controller mount. It holds the
//! limit files written at setup and the usage counters read while an
//! experiment runs.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::Result;

/// Default mount point of the v1 memory controller.
pub const DEFAULT_ROOT: &str = "/sys/fs/cgroup/memory";

/// Swappiness written to every domain so the kernel pages out before it kills.
pub const MAX_SWAPPINESS: u64 = 100;

const PROCS_FILE: &str = "cgroup.procs";
const LIMIT_FILE: &str = "memory.limit_in_bytes";
const MEMSW_LIMIT_FILE: &str = "memory.memsw.limit_in_bytes";
const SWAPPINESS_FILE: &str = "memory.swappiness";
const USAGE_FILE: &str = "memory.usage_in_bytes";
const MEMSW_USAGE_FILE: &str = "memory.memsw.usage_in_bytes";

/// Snapshot of a domain's usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSample {
    /// Bytes charged as resident memory
    pub resident_bytes: u64,
    /// Bytes charged as resident memory plus swap
    pub resident_plus_swap_bytes: u64,
}

impl UsageSample {
    pub fn new(resident_bytes: u64, resident_plus_swap_bytes: u64) -> Self {
        Self {
            resident_bytes,
            resident_plus_swap_bytes,
        }
    }

    /// True once the domain has started using swap.
    pub fn is_paging(&self) -> bool {
        self.resident_plus_swap_bytes != self.resident_bytes
    }

    /// Bytes left under `limit_bytes` according to the resident+swap counter.
    pub fn headroom(&self, limit_bytes: u64) -> u64 {
        limit_bytes.saturating_sub(self.resident_plus_swap_bytes)
    }
}

/// Limits read back from a configured domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainLimits {
    pub resident_bytes: u64,
    pub resident_plus_swap_bytes: u64,
    pub swappiness: u64,
}

/// Kind of filesystem the controller is rooted in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hierarchy {
    /// A mounted cgroup v1 memory controller.
    Kernel,
    /// A plain scratch directory that mimics the controller files.
    ///
    /// New domains start with their usage counters set to `seed`. Removal is
    /// refused while any pid listed in `cgroup.procs` still exists.
    Emulated { seed: UsageSample },
}

/// Creates memory domains under a controller root
#[derive(Debug, Clone)]
pub struct MemoryController {
    root: PathBuf,
    hierarchy: Hierarchy,
}

impl Default for MemoryController {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}

impl MemoryController {
    /// Create a controller for the kernel hierarchy mounted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            hierarchy: Hierarchy::Kernel,
        }
    }

    /// Create a controller over a scratch directory, seeding usage counters with `seed`
    pub fn emulated(root: impl Into<PathBuf>, seed: UsageSample) -> Self {
        Self {
            root: root.into(),
            hierarchy: Hierarchy::Emulated { seed },
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn hierarchy(&self) -> Hierarchy {
        self.hierarchy
    }

    /// Allocate a uniquely named domain and configure it to `limit_bytes`
    pub fn create(&self, limit_bytes: u64) -> Result<MemoryDomain> {
        if limit_bytes == 0 {
            return Err(Error::Setup("memory limit must be greater than zero".to_string()));
        }

        let id = format!("oomrace-{}", Uuid::new_v4());
        let path = self.root.join(&id);
        DirBuilder::new()
            .mode(0o755)
            .create(&path)
            .map_err(|e| Error::io("creating domain", &path, e))?;

        if let Hierarchy::Emulated { seed } = self.hierarchy {
            write_file(&path.join(PROCS_FILE), "", "seeding")?;
            write_value(&path.join(USAGE_FILE), seed.resident_bytes, "seeding")?;
            write_value(&path.join(MEMSW_USAGE_FILE), seed.resident_plus_swap_bytes, "seeding")?;
        }

        let mut domain = MemoryDomain {
            id,
            path,
            limit_bytes,
            hierarchy: self.hierarchy,
        };

        if let Err(e) = domain.configure(limit_bytes) {
            if let Err(cleanup) = domain.remove() {
                warn!("Failed to remove half-configured domain {}: {}", domain.id, cleanup);
            }
            return Err(e);
        }

        info!("Created domain {} with limit {}B", domain.id, limit_bytes);
        Ok(domain)
    }
}

/// One memory accounting domain
#[derive(Debug)]
pub struct MemoryDomain {
    id: String,
    path: PathBuf,
    limit_bytes: u64,
    hierarchy: Hierarchy,
}

impl MemoryDomain {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Limit applied to both the resident and resident+swap counters
    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    /// Set both limits to `limit_bytes` and swappiness to the maximum
    pub fn configure(&mut self, limit_bytes: u64) -> Result<()> {
        // memsw must never drop below the resident limit, so resident goes first
        write_value(&self.path.join(LIMIT_FILE), limit_bytes, "writing mem limit")?;
        write_value(&self.path.join(MEMSW_LIMIT_FILE), limit_bytes, "writing memsw limit")?;
        write_value(&self.path.join(SWAPPINESS_FILE), MAX_SWAPPINESS, "setting swappiness")?;
        self.limit_bytes = limit_bytes;
        debug!("Configured domain {} to {}B, swappiness {}", self.id, limit_bytes, MAX_SWAPPINESS);
        Ok(())
    }

    /// Read back the configured limits
    pub fn limits(&self) -> Result<DomainLimits> {
        Ok(DomainLimits {
            resident_bytes: read_counter(&self.path.join(LIMIT_FILE))?,
            resident_plus_swap_bytes: read_counter(&self.path.join(MEMSW_LIMIT_FILE))?,
            swappiness: read_counter(&self.path.join(SWAPPINESS_FILE))?,
        })
    }

    /// Read the resident and resident+swap usage counters
    pub fn read_usage(&self) -> Result<UsageSample> {
        let resident_bytes = read_counter(&self.path.join(USAGE_FILE))?;
        let resident_plus_swap_bytes = read_counter(&self.path.join(MEMSW_USAGE_FILE))?;
        Ok(UsageSample {
            resident_bytes,
            resident_plus_swap_bytes,
        })
    }

    /// Add `pid` to the domain's membership
    pub fn attach(&self, pid: u32) -> Result<()> {
        let path = self.procs_path();
        let mut procs = self.open_procs()?;
        procs
            .write_all(format!("{}\n", pid).as_bytes())
            .map_err(|e| Error::io("attaching pid to", &path, e))?;
        debug!("Attached pid {} to domain {}", pid, self.id);
        Ok(())
    }

    /// Open the membership file for writing.
    ///
    /// The handle stays valid across fork, which lets a child attach itself
    /// before exec.
    pub fn open_procs(&self) -> Result<File> {
        let path = self.procs_path();
        OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| Error::io("opening", &path, e))
    }

    /// Pids currently listed in the membership file
    pub fn members(&self) -> Result<Vec<u32>> {
        let path = self.procs_path();
        let raw = fs::read_to_string(&path).map_err(|e| Error::io("reading", &path, e))?;
        raw.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                line.parse().map_err(|_| Error::Parse {
                    path: path.clone(),
                    value: line.to_string(),
                })
            })
            .collect()
    }

    /// Destroy the domain. Fails with [`Error::Busy`] while members remain.
    pub fn remove(&self) -> Result<()> {
        match self.hierarchy {
            Hierarchy::Kernel => fs::remove_dir(&self.path).map_err(|e| match e.raw_os_error() {
                Some(code) if code == Errno::EBUSY as i32 || code == Errno::ENOTEMPTY as i32 => {
                    Error::Busy {
                        id: self.id.clone(),
                    }
                }
                _ => Error::io("removing domain", &self.path, e),
            })?,
            Hierarchy::Emulated { .. } => {
                if self.members()?.into_iter().any(pid_exists) {
                    return Err(Error::Busy {
                        id: self.id.clone(),
                    });
                }
                fs::remove_dir_all(&self.path)
                    .map_err(|e| Error::io("removing domain", &self.path, e))?;
            }
        }

        info!("Removed domain {}", self.id);
        Ok(())
    }

    fn procs_path(&self) -> PathBuf {
        self.path.join(PROCS_FILE)
    }
}

/// Unreaped zombies still count as existing.
fn pid_exists(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn read_counter(path: &Path) -> Result<u64> {
    let raw = fs::read_to_string(path).map_err(|e| Error::io("reading", path, e))?;
    let value = raw.trim();
    value.parse().map_err(|_| Error::Parse {
        path: path.to_path_buf(),
        value: value.to_string(),
    })
}

fn write_value(path: &Path, value: u64, action: &'static str) -> Result<()> {
    write_file(path, &value.to_string(), action)
}

fn write_file(path: &Path, contents: &str, action: &'static str) -> Result<()> {
    fs::write(path, contents).map_err(|e| Error::io(action, path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn scratch(seed: UsageSample) -> (TempDir, MemoryController) {
        let dir = TempDir::new().unwrap();
        let controller = MemoryController::emulated(dir.path(), seed);
        (dir, controller)
    }

    #[test]
    fn test_configure_reads_back_limits() {
        let (_dir, controller) = scratch(UsageSample::default());
        for limit in [1, 4096, 104_857_600, u64::MAX] {
            let domain = controller.create(limit).unwrap();
            let limits = domain.limits().unwrap();
            assert_eq!(limits.resident_bytes, limit);
            assert_eq!(limits.resident_plus_swap_bytes, limit);
            assert_eq!(limits.swappiness, MAX_SWAPPINESS);
            assert_eq!(domain.limit_bytes(), limit);
            domain.remove().unwrap();
        }
    }

    #[test]
    fn test_reconfigure_updates_limit() {
        let (_dir, controller) = scratch(UsageSample::default());
        let mut domain = controller.create(8192).unwrap();
        domain.configure(16384).unwrap();
        assert_eq!(domain.limits().unwrap().resident_plus_swap_bytes, 16384);
        assert_eq!(domain.limit_bytes(), 16384);
    }

    #[test]
    fn test_zero_limit_is_rejected() {
        let (dir, controller) = scratch(UsageSample::default());
        assert!(matches!(controller.create(0), Err(Error::Setup(_))));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_domain_ids_are_unique() {
        let (_dir, controller) = scratch(UsageSample::default());
        let a = controller.create(4096).unwrap();
        let b = controller.create(4096).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with("oomrace-"));
        assert_eq!(a.path(), controller.root().join(a.id()));
    }

    #[test]
    fn test_read_usage_returns_seeded_counters() {
        let seed = UsageSample::new(100_000_000, 104_857_600);
        let (_dir, controller) = scratch(seed);
        let domain = controller.create(104_857_600).unwrap();
        assert_eq!(domain.read_usage().unwrap(), seed);
    }

    #[test]
    fn test_read_usage_rejects_garbage() {
        let (_dir, controller) = scratch(UsageSample::default());
        let domain = controller.create(4096).unwrap();
        fs::write(domain.path().join(MEMSW_USAGE_FILE), "lots\n").unwrap();
        let err = domain.read_usage().unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn test_read_usage_fails_after_removal() {
        let (_dir, controller) = scratch(UsageSample::default());
        let domain = controller.create(4096).unwrap();
        domain.remove().unwrap();
        assert!(matches!(domain.read_usage(), Err(Error::Io { .. })));
    }

    #[test]
    fn test_counters_tolerate_trailing_newline() {
        let (_dir, controller) = scratch(UsageSample::default());
        let domain = controller.create(4096).unwrap();
        fs::write(domain.path().join(USAGE_FILE), "12\n").unwrap();
        fs::write(domain.path().join(MEMSW_USAGE_FILE), " 34 \n").unwrap();
        assert_eq!(domain.read_usage().unwrap(), UsageSample::new(12, 34));
    }

    #[test]
    fn test_attach_lists_member() {
        let (_dir, controller) = scratch(UsageSample::default());
        let domain = controller.create(4096).unwrap();
        domain.attach(4242).unwrap();
        domain.attach(4343).unwrap();
        assert_eq!(domain.members().unwrap(), vec![4242, 4343]);
    }

    #[test]
    fn test_remove_refuses_live_member_until_reaped() {
        let (_dir, controller) = scratch(UsageSample::default());
        let domain = controller.create(4096).unwrap();

        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        domain.attach(child.id()).unwrap();
        assert!(matches!(domain.remove(), Err(Error::Busy { .. })));

        child.kill().unwrap();
        child.wait().unwrap();
        domain.remove().unwrap();
        assert!(!domain.path().exists());
    }

    #[test]
    fn test_unreaped_zombie_keeps_domain_busy() {
        let (_dir, controller) = scratch(UsageSample::default());
        let domain = controller.create(4096).unwrap();

        let mut child = Command::new("true").spawn().unwrap();
        domain.attach(child.id()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(matches!(domain.remove(), Err(Error::Busy { .. })));

        child.wait().unwrap();
        domain.remove().unwrap();
    }

    #[test]
    fn test_headroom_saturates() {
        let sample = UsageSample::new(10, 200);
        assert_eq!(sample.headroom(1000), 800);
        assert_eq!(sample.headroom(100), 0);
        assert!(sample.is_paging());
        assert!(!UsageSample::new(5, 5).is_paging());
    }
}
