use std::fs;
use std::io;
use std::os::fd::AsRawFd;

use super::LocalFile;

/// Ensures every local file exists at its declared length.
///
/// Parent directories are created as needed, then each file is created (if
/// missing) and preallocated with `posix_fallocate`, so later piece writes
/// at any offset land inside the file.
pub fn ensure_local_files(files: &[LocalFile]) -> io::Result<()> {
    for local_file in files {
        if let Some(parent) = local_file.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&local_file.path)?;

        if local_file.length > 0 {
            nix::fcntl::posix_fallocate(file.as_raw_fd(), 0, local_file.length as i64)
                .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
        }
    }
    Ok(())
}
