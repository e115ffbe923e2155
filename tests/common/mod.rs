#![allow(dead_code)]

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use bruma::io::Slab;
use bruma::PAGE_SIZE;

pub fn scratch_dir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("bruma-test")
        .tempdir_in(env!("CARGO_TARGET_TMPDIR"))
        .expect("create scratch dir")
}

/// Direct I/O and io_uring are host capabilities, not code under test.
/// tmpfs rejects O_DIRECT and hardened kernels disable io_uring, so
/// probe first and skip loudly instead of failing.
pub fn storage_supported(dir: &Path) -> bool {
    if let Err(err) = io_uring::IoUring::new(8) {
        eprintln!("skipping: io_uring unavailable: {err}");
        return false;
    }
    let probe_path = dir.join("odirect_probe.tmp");
    let file = match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .custom_flags(libc::O_DIRECT)
        .open(&probe_path)
    {
        Ok(file) => file,
        Err(err) => {
            eprintln!("skipping: O_DIRECT open failed: {err}");
            return false;
        }
    };
    let slab = Slab::new(PAGE_SIZE).expect("probe slab");
    let wrote =
        unsafe { libc::pwrite(file.as_raw_fd(), slab.page_ptr(0).cast(), PAGE_SIZE, 0) };
    if wrote != PAGE_SIZE as isize {
        eprintln!("skipping: aligned O_DIRECT write rejected (likely tmpfs)");
        return false;
    }
    true
}
