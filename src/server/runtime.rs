/// Size the tokio worker pool from the container CPU limit rather than the
/// host core count — a pod limited to 2 cores on a 64-core host should not
/// run 64 workers.
///
/// Sources, in order: `AEGIS_CPU_LIMIT` env ("2" or "2000m"), cgroup v2
/// `cpu.max`, cgroup v1 quota/period, then `available_parallelism`.
pub fn worker_thread_count() -> usize {
    let detected = std::env::var("AEGIS_CPU_LIMIT")
        .ok()
        .as_deref()
        .and_then(parse_cpu_value)
        .or_else(|| {
            std::fs::read_to_string("/sys/fs/cgroup/cpu.max")
                .ok()
                .as_deref()
                .and_then(parse_cgroup_v2)
        })
        .or_else(|| {
            let quota = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us").ok()?;
            let period = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us").ok()?;
            parse_cgroup_v1(&quota, &period)
        });

    match detected {
        Some(cores) => {
            let threads = cores.max(1);
            eprintln!("[runtime] worker threads from cpu limit: {}", threads);
            threads
        }
        None => {
            let threads = std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(1);
            eprintln!("[runtime] worker threads from host cpu count: {}", threads);
            threads
        }
    }
}

/// "2" (cores) or "2000m" (millicores).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    match value.strip_suffix('m') {
        Some(millis) => millis.parse::<usize>().ok().map(|m| m / 1000),
        None => value.parse::<usize>().ok(),
    }
}

/// cgroup v2 `cpu.max`: "quota period", or "max period" for unlimited.
fn parse_cgroup_v2(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period: i64 = parts.next()?.parse().ok()?;
    if quota == "max" || period <= 0 {
        return None;
    }
    let quota: i64 = quota.parse().ok()?;
    if quota <= 0 {
        return None;
    }
    Some((quota / period) as usize)
}

fn parse_cgroup_v1(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.trim().parse().ok()?;
    let period: i64 = period.trim().parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period) as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_value() {
        assert_eq!(parse_cpu_value("4"), Some(4));
        assert_eq!(parse_cpu_value(" 8 "), Some(8));
        assert_eq!(parse_cpu_value("4000m"), Some(4));
        // Fractional cores floor to 0; the caller clamps to 1.
        assert_eq!(parse_cpu_value("500m"), Some(0));
        assert_eq!(parse_cpu_value("abc"), None);
    }

    #[test]
    fn test_parse_cgroup_v2() {
        assert_eq!(parse_cgroup_v2("400000 100000"), Some(4));
        assert_eq!(parse_cgroup_v2("max 100000"), None);
        assert_eq!(parse_cgroup_v2(""), None);
        assert_eq!(parse_cgroup_v2("-1 100000"), None);
    }

    #[test]
    fn test_parse_cgroup_v1() {
        assert_eq!(parse_cgroup_v1("200000", "100000"), Some(2));
        assert_eq!(parse_cgroup_v1("-1", "100000"), None);
        assert_eq!(parse_cgroup_v1("0", "100000"), None);
    }
}
