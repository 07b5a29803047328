// SPDX-FileCopyrightText: 2026 img2sdat contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, io, path::Path};

use num_traits::PrimInt;
use tempfile::NamedTempFile;

pub const ZEROS: [u8; 16384] = [0u8; 16384];

/// A small wrapper to format a number as a size in bytes.
#[derive(Clone, Copy)]
pub struct NumBytes<T: PrimInt>(pub T);

impl<T: PrimInt + fmt::Debug> fmt::Debug for NumBytes<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == T::one() {
            write!(f, "<{:?} byte>", self.0)
        } else {
            write!(f, "<{:?} bytes>", self.0)
        }
    }
}

/// If every little-endian 32-bit word in `buf` is identical, return that word.
/// This is how sparse image tools decide that a block can be stored as a fill
/// chunk. `buf` must be a non-empty multiple of 4 bytes.
pub fn fill_word(buf: &[u8]) -> Option<u32> {
    let (first, rest) = buf.split_first_chunk::<4>()?;

    if rest.len() % 4 != 0 || !rest.chunks_exact(4).all(|c| c == first) {
        return None;
    }

    Some(u32::from_le_bytes(*first))
}

/// Get the non-empty parent of a path. If the path has no parent in the string,
/// then `.` is returned. This does not perform any filesystem operations.
pub fn parent_path(path: &Path) -> &Path {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        return parent;
    }

    Path::new(".")
}

/// Create a temporary file in the same directory as `path` so that it can be
/// atomically renamed over `path` with [`persist_temp`].
pub fn create_temp_beside(path: &Path) -> io::Result<NamedTempFile> {
    let name = path.file_name().unwrap_or(path.as_os_str());

    NamedTempFile::with_prefix_in(name, parent_path(path))
}

/// Compute the default file mode from the process umask. The umask can only
/// be read by temporarily changing it, which affects every thread.
#[cfg(unix)]
#[allow(clippy::useless_conversion)]
fn mode_from_umask() -> u32 {
    use rustix::{fs::Mode, process::umask};

    let mask = umask(Mode::empty());
    umask(mask);

    // Mac uses a 16-bit value.
    u32::from(0o666 & !mask.bits())
}

/// Permissions for newly created output files. The umask is only queried on
/// the first call, which should happen before worker threads create files.
#[cfg(unix)]
pub fn output_file_mode() -> u32 {
    use std::sync::OnceLock;

    static MODE: OnceLock<u32> = OnceLock::new();

    *MODE.get_or_init(mode_from_umask)
}

/// Move a temporary file to `path`.
pub fn persist_temp(temp: NamedTempFile, path: &Path) -> io::Result<()> {
    // NamedTempFile forces 600 permissions on temp files because it's the safe
    // option for a shared /tmp. Since we're writing to the output file's
    // directory, just mimic umask.
    #[cfg(unix)]
    {
        use std::{fs::Permissions, os::unix::prelude::PermissionsExt};

        temp.as_file()
            .set_permissions(Permissions::from_mode(output_file_mode()))?;
    }

    temp.persist(path).map_err(|e| e.error)?;

    Ok(())
}
