//! Process-tree termination: given a PID, kill it and all descendants.
//!
//! Platform seam with one function-shaped contract. Processes that are
//! already gone are not errors — the desired postcondition ("tree is not
//! running") already holds, so every failure here is swallowed.

/// Kill `root` and every process transitively spawned by it.
#[cfg(unix)]
pub async fn kill_tree(root: u32) {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    // If the child owns its process group (detached spawn), one killpg
    // takes out everything that stayed in the group.
    let pid = Pid::from_raw(i32::try_from(root).unwrap_or(i32::MAX));
    let _ = killpg(pid, Signal::SIGKILL);

    // Group escapees (setsid grandchildren, interpreters that re-group)
    // are collected from the process table, children first.
    for descendant in collect_descendants(root) {
        let _ = kill(
            Pid::from_raw(i32::try_from(descendant).unwrap_or(i32::MAX)),
            Signal::SIGKILL,
        );
    }
    let _ = kill(pid, Signal::SIGKILL);
}

#[cfg(windows)]
pub async fn kill_tree(root: u32) {
    // taskkill enumerates and terminates the tree in one call.
    let _ = tokio::process::Command::new("taskkill")
        .args(["/PID", &root.to_string(), "/T", "/F"])
        .output()
        .await;
}

/// Transitive descendants of `root`, deepest first so children die before
/// their parents can reap-and-respawn.
#[cfg(unix)]
fn collect_descendants(root: u32) -> Vec<u32> {
    let mut children_of: std::collections::HashMap<u32, Vec<u32>> =
        std::collections::HashMap::new();
    for (pid, ppid) in read_process_table() {
        children_of.entry(ppid).or_default().push(pid);
    }

    let mut ordered = Vec::new();
    let mut frontier = vec![root];
    while let Some(pid) = frontier.pop() {
        if let Some(children) = children_of.get(&pid) {
            for &child in children {
                ordered.push(child);
                frontier.push(child);
            }
        }
    }
    ordered.reverse();
    ordered
}

/// `(pid, ppid)` pairs from /proc. Returns an empty table on platforms
/// without procfs (macOS), where the killpg path above has to suffice.
#[cfg(unix)]
fn read_process_table() -> Vec<(u32, u32)> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };

    let mut table = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(ppid) = parse_ppid(&stat) {
            table.push((pid, ppid));
        }
    }
    table
}

/// Parse the ppid (field 4) out of a /proc/<pid>/stat line. The comm field
/// is parenthesized and may itself contain spaces or parens, so fields are
/// counted from after the closing paren.
#[cfg(unix)]
fn parse_ppid(stat: &str) -> Option<u32> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().nth(1)?.parse().ok()
}
