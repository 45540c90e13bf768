/// Host limit checks that affect how many clients and probes a run can hold open
use std::fs;
use tracing::{info, warn};

/// Open sockets per aggregated inbound while a shard is under test
/// (inbound, outbound and the probe side).
const FDS_PER_INBOUND: u64 = 3;

/// Headroom for download workers, site pings and client internals.
const FD_HEADROOM: u64 = 1024;

/// Soft "Max open files" limit from a `/proc/<pid>/limits` document.
fn parse_fd_soft_limit(limits: &str) -> Option<u64> {
    let line = limits.lines().find(|l| l.starts_with("Max open files"))?;
    // "Max open files  <soft>  <hard>  files"
    line.split_whitespace().nth(3)?.parse().ok()
}

/// `(low, high)` from `/proc/sys/net/ipv4/ip_local_port_range`.
fn parse_port_range(content: &str) -> Option<(u16, u16)> {
    let mut parts = content.split_whitespace();
    let low = parts.next()?.parse().ok()?;
    let high = parts.next()?.parse().ok()?;
    Some((low, high))
}

/// Ports in `[base_port, 65535]` that the kernel may hand out as ephemeral
/// source ports, racing the port allocator.
fn ephemeral_overlap(base_port: u16, range: (u16, u16)) -> u32 {
    let (low, high) = range;
    if high < base_port {
        return 0;
    }
    let start = low.max(base_port) as u32;
    (high as u32 + 1).saturating_sub(start)
}

fn required_fds(shard_size: usize, concurrency: usize, download_threads: usize) -> u64 {
    shard_size as u64 * FDS_PER_INBOUND + (concurrency * download_threads) as u64 + FD_HEADROOM
}

fn check_fd_limit(required: u64) -> bool {
    let Ok(content) = fs::read_to_string("/proc/self/limits") else {
        return true;
    };
    match parse_fd_soft_limit(&content) {
        Some(soft) if soft < required => {
            warn!(
                soft_limit = soft,
                required, "File descriptor limit (ulimit -n) is low for this shard size"
            );
            warn!("    Suggested: 'ulimit -n {}' or lower batch.shard_size", required);
            false
        }
        _ => true,
    }
}

fn check_port_range(base_port: u16) -> bool {
    let Ok(content) = fs::read_to_string("/proc/sys/net/ipv4/ip_local_port_range") else {
        return true;
    };
    let Some(range) = parse_port_range(&content) else {
        return true;
    };
    let overlap = ephemeral_overlap(base_port, range);
    if overlap > 0 {
        warn!(
            base_port,
            ephemeral_low = range.0,
            ephemeral_high = range.1,
            overlap,
            "Client inbound ports overlap the ephemeral port range"
        );
        warn!("    Busy ports are skipped, but shards may run short of ports under load");
        return false;
    }
    true
}

/// Log warnings for host limits that would starve a run of descriptors or ports.
pub fn check_host_limits(
    base_port: u16,
    shard_size: usize,
    concurrency: usize,
    download_threads: usize,
) {
    info!("Checking host limits...");
    let fds_ok = check_fd_limit(required_fds(shard_size, concurrency, download_threads));
    let ports_ok = check_port_range(base_port);
    if fds_ok && ports_ok {
        info!("Host limits look sufficient");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_host_limits_does_not_panic() {
        check_host_limits(32768, 1024, 256, 4);
    }

    #[test]
    fn test_parse_fd_soft_limit() {
        let limits = "Limit                     Soft Limit           Hard Limit           Units\n\
                      Max cpu time              unlimited            unlimited            seconds\n\
                      Max open files            1024                 524288               files\n";
        assert_eq!(parse_fd_soft_limit(limits), Some(1024));
        assert_eq!(parse_fd_soft_limit("Max cpu time unlimited"), None);
    }

    #[test]
    fn test_ephemeral_overlap() {
        assert_eq!(parse_port_range("32768\t60999\n"), Some((32768, 60999)));
        assert_eq!(ephemeral_overlap(32768, (32768, 60999)), 28232);
        assert_eq!(ephemeral_overlap(61000, (32768, 60999)), 0);
        assert_eq!(ephemeral_overlap(10000, (32768, 60999)), 28232);
        assert_eq!(ephemeral_overlap(50000, (32768, 60999)), 11000);
    }

    #[test]
    fn test_required_fds() {
        assert_eq!(required_fds(0, 0, 4), FD_HEADROOM);
        assert_eq!(required_fds(100, 10, 4), 300 + 40 + FD_HEADROOM);
    }
}
