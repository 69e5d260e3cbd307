//! Resource usage of a session-backed boundary, read from `/proc`.
use berth_core::collab::ResourceStatistics;
use berth_model::Resources;

/// Per-process counters taken from `/proc/<pid>/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProcStat {
    pub(crate) pid: u32,
    pub(crate) session: u32,
    /// Clock ticks.
    pub(crate) utime: u64,
    pub(crate) stime: u64,
    /// Pages.
    pub(crate) rss: u64,
}

/// Parses one `/proc/<pid>/stat` line. The command name may hold spaces and
/// parentheses, so fields are counted from the last `)`.
pub(crate) fn parse_stat(line: &str) -> Option<ProcStat> {
    let (head, tail) = line.rsplit_once(')')?;
    let pid = head.split_once('(')?.0.trim().parse().ok()?;
    let fields: Vec<&str> = tail.split_whitespace().collect();
    Some(ProcStat {
        pid,
        session: fields.get(3)?.parse().ok()?,
        utime: fields.get(11)?.parse().ok()?,
        stime: fields.get(12)?.parse().ok()?,
        rss: fields.get(21)?.parse::<i64>().ok()?.max(0) as u64,
    })
}

/// Limits advertised by the boundary's grant.
pub(crate) fn limits(resources: &Resources, stats: &mut ResourceStatistics) {
    let cpus = resources.get("cpus");
    if cpus > 0.0 {
        stats.cpus_limit = Some(cpus);
    }
    let mem = resources.get("mem");
    if mem > 0.0 {
        stats.mem_limit_bytes = Some((mem * 1024.0 * 1024.0) as u64);
    }
}

/// Adds up every process in the session led by `leader`.
pub(crate) fn accumulate(leader: u32, processes: impl IntoIterator<Item = ProcStat>, stats: &mut ResourceStatistics) {
    let (ticks, page) = units();
    let mut count = 0u32;
    let (mut utime, mut stime, mut rss) = (0u64, 0u64, 0u64);
    for p in processes {
        if p.session != leader && p.pid != leader {
            continue;
        }
        count += 1;
        utime += p.utime;
        stime += p.stime;
        rss += p.rss;
    }
    stats.processes = Some(count);
    stats.cpus_user_time_secs = Some(utime as f64 / ticks);
    stats.cpus_system_time_secs = Some(stime as f64 / ticks);
    stats.mem_rss_bytes = Some(rss * page);
}

/// Every readable `/proc/<pid>/stat`. Processes that vanish mid-scan are
/// skipped.
#[cfg(target_os = "linux")]
pub(crate) fn scan_proc() -> std::io::Result<Vec<ProcStat>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir("/proc")? {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if let Ok(line) = std::fs::read_to_string(entry.path().join("stat")) {
            out.extend(parse_stat(&line));
        }
    }
    Ok(out)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn scan_proc() -> std::io::Result<Vec<ProcStat>> {
    Ok(Vec::new())
}

#[cfg(unix)]
fn units() -> (f64, u64) {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    (
        if ticks > 0 { ticks as f64 } else { 100.0 },
        if page > 0 { page as u64 } else { 4096 },
    )
}

#[cfg(not(unix))]
fn units() -> (f64, u64) {
    (100.0, 4096)
}
