//! Probes of the calling process's environment under `/proc`.

use std::fs;

use anyhow::{anyhow, Context, Error};
use nix::unistd::geteuid;

/// The uid map of a process that owns the whole host uid range.
const HOST_UID_MAP: [&str; 3] = ["0", "0", "4294967295"];

/// Returns the mount namespace id of the calling process, i.e. the `N` in
/// the `mnt:[N]` target of `/proc/self/ns/mnt`.
pub fn mount_namespace_id() -> Result<String, Error> {
    let link = fs::read_link("/proc/self/ns/mnt").context("Failed to read /proc/self/ns/mnt")?;
    let link = link.to_string_lossy();
    namespace_id_from_link(&link)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("unexpected mount namespace link '{link}'"))
}

fn namespace_id_from_link(link: &str) -> Option<&str> {
    link.strip_prefix("mnt:[")?.strip_suffix(']')
}

/// Takes `/proc/self/uid_map` contents as one string and returns true if it
/// represents the whole host uid range.
fn uidmap_is_host(uidmap: &str) -> bool {
    let uidmap = uidmap.strip_suffix('\n').unwrap_or(uidmap);
    if uidmap.is_empty() {
        return false;
    }

    let lines: Vec<&str> = uidmap.split('\n').collect();
    if lines.len() != 1 {
        return false;
    }

    let words: Vec<&str> = lines[0].split_whitespace().collect();
    words == HOST_UID_MAP
}

/// Returns whether the caller is root in the initial user namespace. Mapped
/// root inside a user namespace does not count.
pub fn am_host_root() -> bool {
    if !geteuid().is_root() {
        return false;
    }
    match fs::read_to_string("/proc/self/uid_map") {
        Ok(uidmap) => uidmap_is_host(&uidmap),
        Err(_) => false,
    }
}

/// Returns whether the caller has (possibly namespaced) root privileges.
pub fn am_privileged() -> bool {
    geteuid().is_root()
}

/// The system page size. Falls back to 4 KiB if sysconf cannot report it.
pub fn page_size() -> u64 {
    use nix::unistd::{sysconf, SysconfVar};

    sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|size| size as u64)
        .unwrap_or(4096)
}
