//! Managed disk images.
//!
//! All VM disks live in one directory, one file per VM named
//! `<name>.<ext>`. A path is *managed* only if it names a file directly
//! inside that directory; nothing elsewhere, subdirectories included, is
//! ever created or deleted here.

use async_trait::async_trait;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::error::DiskError;
use crate::types::{DiskFormat, ManagedDisk};

/// Default directory for managed disk images.
pub const DEFAULT_IMAGE_DIR: &str = "/var/lib/libvirt/images";

/// Captured result of an image tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Exit code, `None` when terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// External program that allocates disk images.
///
/// Returning `Err` means the tool could not be run at all; a tool that ran
/// and failed reports it through [`ToolOutput::exit_code`].
#[async_trait]
pub trait ImageTool: Send + Sync {
    /// Name used in error messages.
    fn name(&self) -> &str;

    /// Create a sparse image of `size_gib` at `path`.
    async fn create_image(&self, path: &Path, format: DiskFormat, size_gib: u64) -> io::Result<ToolOutput>;
}

/// `qemu-img create` wrapper.
pub struct QemuImg {
    binary: String,
}

impl QemuImg {
    /// Use `qemu-img` from `PATH`.
    pub fn new() -> Self {
        Self { binary: "qemu-img".to_string() }
    }

    /// Use a specific qemu-img binary.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Default for QemuImg {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageTool for QemuImg {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn create_image(&self, path: &Path, format: DiskFormat, size_gib: u64) -> io::Result<ToolOutput> {
        let output = Command::new(&self.binary)
            .arg("create")
            .args(["-f", format.as_str()])
            .arg(path)
            .arg(format!("{}G", size_gib))
            .stdin(Stdio::null())
            .output()
            .await?;

        Ok(ToolOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Creates and removes disk images inside the managed directory.
#[derive(Clone)]
pub struct DiskProvisioner {
    image_dir: PathBuf,
    format: DiskFormat,
    tool: Arc<dyn ImageTool>,
}

impl DiskProvisioner {
    /// Create a provisioner for `image_dir`.
    pub fn new(image_dir: impl Into<PathBuf>, format: DiskFormat, tool: Arc<dyn ImageTool>) -> Self {
        Self {
            image_dir: image_dir.into(),
            format,
            tool,
        }
    }

    /// Provisioner backed by `qemu-img` in the default image directory.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_IMAGE_DIR, DiskFormat::default(), Arc::new(QemuImg::new()))
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    pub fn format(&self) -> DiskFormat {
        self.format
    }

    /// Deterministic image path for a VM name.
    pub fn managed_path(&self, name: &str) -> PathBuf {
        self.image_dir.join(format!("{}.{}", name, self.format.extension()))
    }

    /// True if `path` names a file directly inside the managed directory.
    ///
    /// The check is lexical and the layout is flat: the parent must be the
    /// image directory itself. Paths containing `..` are never managed.
    pub fn is_managed(&self, path: &Path) -> bool {
        if !path.is_absolute() && self.image_dir.is_absolute() {
            return false;
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return false;
        }
        if path.file_name().is_none() {
            return false;
        }
        path.parent() == Some(self.image_dir.as_path())
    }

    /// Allocate a new image. Never overwrites.
    #[instrument(skip(self), fields(path = %path.display(), size_gib = size_gib))]
    pub async fn create(&self, path: &Path, size_gib: u64) -> Result<ManagedDisk, DiskError> {
        if !self.is_managed(path) {
            return Err(DiskError::NotManaged(path.to_path_buf()));
        }
        if size_gib == 0 {
            return Err(DiskError::InvalidSize(size_gib));
        }
        if path.exists() {
            return Err(DiskError::AlreadyExists(path.to_path_buf()));
        }

        if !self.image_dir.exists() {
            debug!(dir = %self.image_dir.display(), "Creating image directory");
            std::fs::create_dir_all(&self.image_dir)?;
        }

        info!(format = self.format.as_str(), "Creating disk image");

        let output = self
            .tool
            .create_image(path, self.format, size_gib)
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => DiskError::ToolUnavailable(self.tool.name().to_string()),
                _ => DiskError::Io(e),
            })?;

        if !output.success() {
            warn!(exit_code = ?output.exit_code, stderr = %output.stderr, "Image tool failed");
            return Err(DiskError::ToolFailed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }

        info!("Disk image created");
        Ok(ManagedDisk {
            path: path.to_path_buf(),
            size_gib,
        })
    }

    /// Delete a managed image.
    ///
    /// Returns `Ok(false)` without touching anything when the path is not
    /// managed or does not exist.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn remove(&self, path: &Path) -> Result<bool, DiskError> {
        if !self.is_managed(path) {
            warn!("Refusing to delete disk outside the managed image directory");
            return Ok(false);
        }
        if !path.exists() {
            debug!("Disk image already absent");
            return Ok(false);
        }

        // The image directory may itself be a symlink; compare resolved parents.
        let parent = path.parent().unwrap_or(&self.image_dir);
        if std::fs::canonicalize(parent)? != std::fs::canonicalize(&self.image_dir)? {
            warn!("Refusing to delete disk whose directory resolves outside the image directory");
            return Ok(false);
        }

        std::fs::remove_file(path)?;
        info!("Disk image deleted");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TouchTool {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageTool for TouchTool {
        fn name(&self) -> &str {
            "touch"
        }

        async fn create_image(&self, path: &Path, _format: DiskFormat, _size_gib: u64) -> io::Result<ToolOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::fs::write(path, b"")?;
            Ok(ToolOutput { exit_code: Some(0), ..Default::default() })
        }
    }

    struct MissingTool;

    #[async_trait]
    impl ImageTool for MissingTool {
        fn name(&self) -> &str {
            "qemu-img-missing"
        }

        async fn create_image(&self, _path: &Path, _format: DiskFormat, _size_gib: u64) -> io::Result<ToolOutput> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no such file"))
        }
    }

    fn provisioner(dir: &Path) -> (DiskProvisioner, Arc<TouchTool>) {
        let tool = Arc::new(TouchTool { calls: AtomicUsize::new(0) });
        (DiskProvisioner::new(dir, DiskFormat::Qcow2, tool.clone()), tool)
    }

    #[test]
    fn test_managed_path() {
        let disks = DiskProvisioner::new("/var/lib/libvirt/images", DiskFormat::Qcow2, Arc::new(QemuImg::new()));
        assert_eq!(disks.managed_path("web01"), PathBuf::from("/var/lib/libvirt/images/web01.qcow2"));

        let raw = DiskProvisioner::new("/var/lib/libvirt/images", DiskFormat::Raw, Arc::new(QemuImg::new()));
        assert_eq!(raw.managed_path("web01"), PathBuf::from("/var/lib/libvirt/images/web01.img"));
    }

    #[test]
    fn test_is_managed() {
        let disks = DiskProvisioner::with_defaults();
        assert!(disks.is_managed(Path::new("/var/lib/libvirt/images/vm.qcow2")));
        assert!(!disks.is_managed(Path::new("/var/lib/libvirt/images")));
        assert!(!disks.is_managed(Path::new("/var/lib/libvirt/images/")));
        assert!(!disks.is_managed(Path::new("/var/lib/libvirt/images/../../../etc/passwd")));
        assert!(!disks.is_managed(Path::new("/var/lib/libvirt/images-other/vm.qcow2")));
        assert!(!disks.is_managed(Path::new("/var/lib/libvirt/images/pool/golden.qcow2")));
        assert!(!disks.is_managed(Path::new("/mnt/shared/golden.qcow2")));
        assert!(!disks.is_managed(Path::new("vm.qcow2")));
    }

    #[tokio::test]
    async fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let (disks, tool) = provisioner(dir.path());
        let path = disks.managed_path("vm");
        std::fs::write(&path, b"keep me").unwrap();

        let err = disks.create(&path, 10).await.unwrap_err();
        assert!(matches!(err, DiskError::AlreadyExists(_)));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read(&path).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_create_rejects_zero_size_and_unmanaged_path() {
        let dir = tempfile::tempdir().unwrap();
        let (disks, tool) = provisioner(dir.path());

        let err = disks.create(&disks.managed_path("vm"), 0).await.unwrap_err();
        assert!(matches!(err, DiskError::InvalidSize(0)));

        let err = disks.create(Path::new("/tmp/elsewhere.qcow2"), 10).await.unwrap_err();
        assert!(matches!(err, DiskError::NotManaged(_)));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_create_makes_missing_image_dir() {
        let dir = tempfile::tempdir().unwrap();
        let image_dir = dir.path().join("images");
        let (disks, _tool) = provisioner(&image_dir);

        let disk = disks.create(&disks.managed_path("vm"), 5).await.unwrap();
        assert_eq!(disk.size_gib, 5);
        assert!(disk.path.exists());
    }

    #[tokio::test]
    async fn test_missing_tool_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let disks = DiskProvisioner::new(dir.path(), DiskFormat::Qcow2, Arc::new(MissingTool));

        let err = disks.create(&disks.managed_path("vm"), 5).await.unwrap_err();
        assert!(matches!(err, DiskError::ToolUnavailable(ref name) if name == "qemu-img-missing"));
    }

    #[tokio::test]
    async fn test_qemu_img_binary_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(QemuImg::with_binary("/nonexistent/qemu-img"));
        let disks = DiskProvisioner::new(dir.path(), DiskFormat::Qcow2, tool);

        let err = disks.create(&disks.managed_path("vm"), 5).await.unwrap_err();
        assert!(matches!(err, DiskError::ToolUnavailable(_)));
    }

    #[test]
    fn test_remove_only_touches_managed_files() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let (disks, _tool) = provisioner(dir.path());

        let managed = disks.managed_path("vm");
        std::fs::write(&managed, b"").unwrap();
        let shared = outside.path().join("golden.qcow2");
        std::fs::write(&shared, b"").unwrap();

        assert!(disks.remove(&managed).unwrap());
        assert!(!managed.exists());

        assert!(!disks.remove(&shared).unwrap());
        assert!(shared.exists());

        assert!(!disks.remove(&managed).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_remove_ignores_symlinked_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        let shared = tempfile::tempdir().unwrap();
        let (disks, _tool) = provisioner(dir.path());

        let golden = shared.path().join("golden.qcow2");
        std::fs::write(&golden, b"").unwrap();
        std::os::unix::fs::symlink(shared.path(), dir.path().join("pool")).unwrap();

        let linked = dir.path().join("pool").join("golden.qcow2");
        assert!(linked.exists());
        assert!(!disks.is_managed(&linked));
        assert!(!disks.remove(&linked).unwrap());
        assert!(golden.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_remove_through_symlinked_image_dir() {
        let real = tempfile::tempdir().unwrap();
        let links = tempfile::tempdir().unwrap();
        let image_dir = links.path().join("images");
        std::os::unix::fs::symlink(real.path(), &image_dir).unwrap();
        let (disks, _tool) = provisioner(&image_dir);

        let managed = disks.managed_path("vm");
        std::fs::write(&managed, b"").unwrap();
        assert!(disks.remove(&managed).unwrap());
        assert!(!real.path().join("vm.qcow2").exists());
    }
}
