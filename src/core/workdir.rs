use std::path::{Path, PathBuf};

use tracing::debug;

use crate::core::error::{CoreError, CoreResult};

/// Maps session names to working directories under a configured root.
///
/// The mapping is deterministic: the same name always yields the same path,
/// so a session reopened after a restart lands in its old directory.
pub struct DirAllocator {
    root: PathBuf,
}

impl DirAllocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve (and create on demand) the directory for `name`.
    pub fn allocate(&self, name: &str) -> CoreResult<PathBuf> {
        let sanitized = sanitize(name);
        let dir_name = if sanitized == name {
            sanitized
        } else {
            // Mangled names get a fingerprint suffix so that two names which
            // sanitize identically ("a/b" and "a_b") cannot collide.
            format!("{}-{:08x}", sanitized, fingerprint(name))
        };
        let path = self.root.join(dir_name);

        if path.is_file() {
            return Err(CoreError::WorkdirInvalid(path));
        }
        if !path.exists() {
            std::fs::create_dir_all(&path).map_err(|_| CoreError::WorkdirInvalid(path.clone()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755));
            }
            debug!("created session workdir {}", path.display());
        }
        Ok(path)
    }

    /// A caller-supplied workdir bypasses sanitization but must already be a
    /// directory.
    pub fn validate_override(&self, path: &Path) -> CoreResult<PathBuf> {
        if path.is_dir() {
            Ok(path.to_path_buf())
        } else {
            Err(CoreError::WorkdirInvalid(path.to_path_buf()))
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// FNV-1a over the original name. Stable across runs, unlike the std hasher.
fn fingerprint(name: &str) -> u32 {
    let mut h: u32 = 0x811c9dc5;
    for b in name.bytes() {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}
