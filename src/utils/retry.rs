use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::queue::types::duration_ms;

/// 重试延迟策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RetryStrategy {
    /// 固定延迟
    Fixed {
        #[serde(with = "duration_ms", rename = "delay_ms")]
        delay: Duration,
    },
    /// 指数退避
    Exponential {
        #[serde(with = "duration_ms", rename = "initial_ms")]
        initial: Duration,
        multiplier: f64,
        #[serde(with = "duration_ms", rename = "max_delay_ms")]
        max_delay: Duration,
    },
}

impl RetryStrategy {
    /// 计算第 n 次重试的延迟
    pub fn get_delay(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::Fixed { delay } => *delay,
            RetryStrategy::Exponential { initial, multiplier, max_delay } => {
                let delay = initial.as_secs_f64() * multiplier.powf(attempt as f64);
                if !delay.is_finite() || delay >= max_delay.as_secs_f64() {
                    return *max_delay;
                }
                std::cmp::min(Duration::from_secs_f64(delay), *max_delay)
            }
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::Exponential {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// 完整性校验失败时的处理方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityFailurePolicy {
    /// 与网络错误一样按退避策略重试
    #[default]
    Retry,
    /// 视为数据损坏，直接失败
    Fail,
}

/// 调度器的自动重试策略，传输失败与校验失败共用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 最大自动重试次数
    pub max_attempts: u32,
    pub strategy: RetryStrategy,
    pub on_integrity_mismatch: IntegrityFailurePolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::default(),
            on_integrity_mismatch: IntegrityFailurePolicy::Retry,
        }
    }
}

impl RetryPolicy {
    /// 已重试 `retry_count` 次后是否还能再重试；可以则返回新的计数和延迟
    pub fn next_attempt(&self, retry_count: u32) -> Option<(u32, Duration)> {
        if retry_count >= self.max_attempts {
            return None;
        }

        let attempt = retry_count + 1;
        Some((attempt, self.strategy.get_delay(attempt)))
    }

    /// 完整性校验失败是否进入重试
    pub fn retries_integrity_mismatch(&self) -> bool {
        self.on_integrity_mismatch == IntegrityFailurePolicy::Retry
    }
}
