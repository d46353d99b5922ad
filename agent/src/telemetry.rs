//! Host telemetry for STATUS replies.
//!
//! ## Data sources
//!
//! | Figure | Source                                             |
//! |--------|----------------------------------------------------|
//! | cpu    | two samples of the first `/proc/stat` line, 100 ms apart |
//! | mem    | `/proc/meminfo` (`MemTotal` − `MemAvailable`)      |
//! | disk   | `statvfs` on the configured path                   |
//!
//! The wire carries KB values with one decimal of CPU precision:
//! `cpu=<float>% mem=<used_kb>/<total_kb> disk=<used_kb>/<total_kb>\n`.
//! Parsers are pure functions over the file contents so they are testable
//! with string fixtures.

use std::time::Duration;

/// Gap between the two `/proc/stat` samples.
const CPU_SAMPLE_GAP: Duration = Duration::from_millis(100);

/// Gather a full STATUS reply payload.
pub async fn gather(disk_path: &str) -> String {
    let cpu = cpu_percent().await;
    let (mem_used_kb, mem_total_kb) = parse_meminfo(&read_proc("/proc/meminfo"));
    let (disk_used_kb, disk_total_kb) = disk_kb(disk_path);
    format_status(
        cpu,
        (mem_used_kb, mem_total_kb),
        (disk_used_kb, disk_total_kb),
    )
}

pub fn format_status(cpu: f32, (mem_used, mem_total): (u64, u64), (disk_used, disk_total): (u64, u64)) -> String {
    format!("cpu={cpu:.1}% mem={mem_used}/{mem_total} disk={disk_used}/{disk_total}\n")
}

fn read_proc(path: &str) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

/// CPU usage over a 100 ms window, clamped to `0..=100`.
pub async fn cpu_percent() -> f32 {
    let Some((idle1, total1)) = parse_cpu_line(&read_proc("/proc/stat")) else {
        return 0.0;
    };
    tokio::time::sleep(CPU_SAMPLE_GAP).await;
    let Some((idle2, total2)) = parse_cpu_line(&read_proc("/proc/stat")) else {
        return 0.0;
    };

    let d_total = total2.saturating_sub(total1);
    let d_idle = idle2.saturating_sub(idle1);
    if d_total == 0 {
        return 0.0;
    }
    (100.0 * (d_total - d_idle.min(d_total)) as f32 / d_total as f32).clamp(0.0, 100.0)
}

/// Parse the aggregate `cpu` line of `/proc/stat` into `(idle, total)`
/// jiffies, where idle includes iowait.
fn parse_cpu_line(stat: &str) -> Option<(u64, u64)> {
    let line = stat.lines().next()?;
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
    if values.len() < 5 {
        return None;
    }
    let idle = values[3] + values[4];
    let total = values.iter().sum();
    Some((idle, total))
}

/// Parse `MemTotal` and `MemAvailable` into a `(used_kb, total_kb)` pair.
fn parse_meminfo(meminfo: &str) -> (u64, u64) {
    let mut total = 0u64;
    let mut available = 0u64;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_kb_value(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_kb_value(rest);
        }
    }
    (total.saturating_sub(available.min(total)), total)
}

fn parse_kb_value(s: &str) -> u64 {
    s.split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Disk usage for a filesystem via the POSIX `statvfs` syscall, in KB.
/// Returns zeros when the path cannot be measured.
pub fn disk_kb(path: &str) -> (u64, u64) {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    let Ok(c_path) = CString::new(path) else {
        return (0, 0);
    };

    let mut stat = MaybeUninit::<libc::statvfs>::uninit();

    // SAFETY: statvfs is a standard POSIX call, we pass a valid C string
    // and a pointer to uninitialized but properly aligned memory.
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if ret != 0 {
        return (0, 0);
    }

    // SAFETY: statvfs returned 0, so stat is fully initialized.
    let stat = unsafe { stat.assume_init() };

    #[allow(clippy::unnecessary_cast)]
    let block_size = stat.f_frsize as u64;
    let total = stat.f_blocks as u64 * block_size;
    let free = stat.f_bfree as u64 * block_size;
    ((total - free) / 1024, total / 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_line_counts_iowait_as_idle() {
        let stat = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 1 2 3 4 5 6 7 8 9 10\n";
        let (idle, total) = parse_cpu_line(stat).unwrap();
        assert_eq!(idle, 850);
        assert_eq!(total, 1000);
    }

    #[test]
    fn cpu_line_rejects_garbage() {
        assert!(parse_cpu_line("").is_none());
        assert!(parse_cpu_line("intr 12345").is_none());
        assert!(parse_cpu_line("cpu 1 2").is_none());
    }

    #[test]
    fn meminfo_used_is_total_minus_available() {
        let meminfo = "MemTotal:       16384256 kB\n\
                       MemFree:         1024000 kB\n\
                       MemAvailable:    8192128 kB\n\
                       Buffers:          512000 kB\n";
        let (used, total) = parse_meminfo(meminfo);
        assert_eq!(total, 16_384_256);
        assert_eq!(used, 16_384_256 - 8_192_128);
    }

    #[test]
    fn meminfo_tolerates_missing_fields() {
        assert_eq!(parse_meminfo(""), (0, 0));
        let (used, total) = parse_meminfo("MemTotal: 1000 kB\n");
        assert_eq!((used, total), (1000, 1000));
    }

    #[test]
    fn meminfo_never_underflows() {
        let meminfo = "MemTotal: 100 kB\nMemAvailable: 200 kB\n";
        let (used, total) = parse_meminfo(meminfo);
        assert_eq!(used, 0);
        assert_eq!(total, 100);
    }

    #[test]
    fn status_line_shape() {
        let line = format_status(12.5, (1024, 2048), (500, 1000));
        assert_eq!(line, "cpu=12.5% mem=1024/2048 disk=500/1000\n");
    }

    #[test]
    fn disk_kb_on_root_reports_nonzero_total() {
        let (_used, total) = disk_kb("/");
        assert!(total > 0);
    }

    #[test]
    fn disk_kb_on_bad_path_reports_zeros() {
        assert_eq!(disk_kb("/definitely/not/a/real/path"), (0, 0));
        assert_eq!(disk_kb("bad\0path"), (0, 0));
    }

    #[tokio::test]
    async fn cpu_percent_is_in_range() {
        let cpu = cpu_percent().await;
        assert!((0.0..=100.0).contains(&cpu));
    }
}
