use std::path::PathBuf;

/// Domain errors of the emulation engine.
///
/// Handlers and services return these; the FUSE layer folds them to POSIX
/// errnos via [`VkernError::errno`], the control plane reports them as
/// status strings.
#[derive(Debug, thiserror::Error)]
pub enum VkernError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("container {0} already exists")]
    AlreadyExists(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("io failure")]
    Io(#[from] std::io::Error),
    #[error("namespace enter failed: {0}")]
    NamespaceEnter(String),
    #[error("operation timed out")]
    Timeout,
    #[error("internal state inconsistency: {0}")]
    Internal(String),
}

impl VkernError {
    pub fn not_found_path(path: &std::path::Path) -> Self {
        VkernError::NotFound(path.display().to_string())
    }

    /// Errno the FUSE layer reports to the kernel for this error.
    pub fn errno(&self) -> i32 {
        match self {
            VkernError::NotFound(_) => libc::ENOENT,
            VkernError::AlreadyExists(_) => libc::EEXIST,
            VkernError::PermissionDenied(_) => libc::EACCES,
            VkernError::Invalid(_) => libc::EINVAL,
            VkernError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            VkernError::NamespaceEnter(_) => libc::EIO,
            VkernError::Timeout => libc::ETIMEDOUT,
            VkernError::Internal(_) => libc::EIO,
        }
    }
}

impl From<nix::Error> for VkernError {
    fn from(errno: nix::Error) -> Self {
        match errno {
            nix::Error::ENOENT | nix::Error::ESRCH => VkernError::NotFound(errno.to_string()),
            nix::Error::EACCES | nix::Error::EPERM => {
                VkernError::PermissionDenied(errno.to_string())
            }
            nix::Error::EINVAL => VkernError::Invalid(errno.to_string()),
            other => VkernError::Io(std::io::Error::from_raw_os_error(other as i32)),
        }
    }
}

/// Maps an `io::Error` to the domain kind, keeping the errno visible.
pub fn from_io(err: std::io::Error, path: &PathBuf) -> VkernError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::NotFound => VkernError::NotFound(path.display().to_string()),
        ErrorKind::PermissionDenied => VkernError::PermissionDenied(path.display().to_string()),
        _ => VkernError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(VkernError::NotFound("x".into()).errno(), libc::ENOENT);
        assert_eq!(
            VkernError::PermissionDenied("x".into()).errno(),
            libc::EACCES
        );
        assert_eq!(VkernError::Invalid("x".into()).errno(), libc::EINVAL);
        assert_eq!(VkernError::Timeout.errno(), libc::ETIMEDOUT);
        assert_eq!(VkernError::Internal("x".into()).errno(), libc::EIO);
    }

    #[test]
    fn test_io_error_kind_mapping() {
        let path = Path::new("/proc/nope").to_path_buf();
        let err = from_io(std::io::Error::from(std::io::ErrorKind::NotFound), &path);
        assert!(matches!(err, VkernError::NotFound(_)));

        let err = from_io(
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            &path,
        );
        assert!(matches!(err, VkernError::PermissionDenied(_)));
    }
}
