use std::time::Duration;

/// 由进度事件推导出的时间估算，不参与持久化
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressEstimate {
    /// 自首次开始上传以来的耗时
    pub elapsed: Duration,
    /// 本轮上传的平均速度（字节/秒）
    pub average_speed: f64,
    /// 预计剩余时间
    pub eta: Option<Duration>,
}

impl ProgressEstimate {
    /// 根据本轮（最近一次恢复/开始以来）的传输量计算
    ///
    /// `stint_base` 为本轮开始时已确认的字节数，恢复前的字节不计入速度。
    pub fn compute(
        total_bytes: u64,
        uploaded_bytes: u64,
        stint_base: u64,
        stint_elapsed: Duration,
        elapsed: Duration,
    ) -> Self {
        let secs = stint_elapsed.as_secs_f64();
        let transferred = uploaded_bytes.saturating_sub(stint_base);
        let average_speed = if secs > 0.0 {
            transferred as f64 / secs
        } else {
            0.0
        };

        let remaining = total_bytes.saturating_sub(uploaded_bytes);
        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if average_speed > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / average_speed))
        } else {
            None
        };

        Self {
            elapsed,
            average_speed,
            eta,
        }
    }
}

/// 格式化字节数
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const UNIT_SIZE: f64 = 1024.0;

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= UNIT_SIZE && unit_index < UNITS.len() - 1 {
        size /= UNIT_SIZE;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// 格式化速度
pub fn format_speed(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_second as u64))
}

/// 格式化持续时间
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_utils() {
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");

        assert_eq!(format_speed(1024.0), "1.00 KB/s");
        assert_eq!(format_speed(1048576.0), "1.00 MB/s");

        assert_eq!(format_duration(Duration::from_secs(59)), "59s");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m 0s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_estimate_ignores_bytes_before_resume() {
        // 恢复前已有 600 字节，本轮 2 秒内又传了 200
        let estimate = ProgressEstimate::compute(
            1000,
            800,
            600,
            Duration::from_secs(2),
            Duration::from_secs(10),
        );

        assert_eq!(estimate.average_speed, 100.0);
        assert_eq!(estimate.eta, Some(Duration::from_secs(2)));
        assert_eq!(estimate.elapsed, Duration::from_secs(10));
    }

    #[test]
    fn test_estimate_without_speed_has_no_eta() {
        let estimate = ProgressEstimate::compute(1000, 0, 0, Duration::ZERO, Duration::ZERO);
        assert_eq!(estimate.average_speed, 0.0);
        assert!(estimate.eta.is_none());
    }
}
