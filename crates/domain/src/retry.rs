use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 重试策略配置
///
/// 退避间隔为 base * 2^(attempts-1) 秒并受max封顶。间隔本身不加抖动，
/// 这个公式是对外契约的一部分；防雷群交给Worker轮询抖动。
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 基础重试间隔（秒）
    pub base_delay_seconds: u64,
    /// 最大重试间隔（秒）
    pub max_delay_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_seconds: 60,  // 1分钟
            max_delay_seconds: 3600, // 1小时
        }
    }
}

impl RetryPolicy {
    /// 第attempt次失败后的退避间隔（attempt从1开始计）
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let seconds = self
            .base_delay_seconds
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_seconds);
        Duration::seconds(seconds as i64)
    }
}

/// 失败处置决定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// 预算未耗尽，按退避时间重新调度
    Retry { run_at: DateTime<Utc> },
    /// 进入死信队列
    DeadLetter,
}

/// 失败处置的纯函数
///
/// 重试/死信的决定只取决于失败结果值和重试账目，与异常传播路径无关。
/// `attempts_after`是本次失败计入后的累计失败次数。
pub fn decide_failure(
    policy: &RetryPolicy,
    attempts_after: u32,
    max_retries: u32,
    retryable: bool,
    now: DateTime<Utc>,
) -> FailureDisposition {
    if !retryable {
        return FailureDisposition::DeadLetter;
    }
    if attempts_after < max_retries {
        FailureDisposition::Retry {
            run_at: now + policy.delay_for_attempt(attempts_after),
        }
    } else {
        FailureDisposition::DeadLetter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base: u64, max: u64) -> RetryPolicy {
        RetryPolicy {
            base_delay_seconds: base,
            max_delay_seconds: max,
        }
    }

    #[test]
    fn test_exponential_backoff_series() {
        let p = policy(60, 3600);
        assert_eq!(p.delay_for_attempt(1).num_seconds(), 60);
        assert_eq!(p.delay_for_attempt(2).num_seconds(), 120);
        assert_eq!(p.delay_for_attempt(3).num_seconds(), 240);
        assert_eq!(p.delay_for_attempt(4).num_seconds(), 480);
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = policy(60, 300);
        assert_eq!(p.delay_for_attempt(10).num_seconds(), 300);
        // 移位不会溢出
        assert_eq!(p.delay_for_attempt(u32::MAX).num_seconds(), 300);
    }

    #[test]
    fn test_retry_within_budget() {
        let p = policy(60, 3600);
        let now = Utc::now();
        match decide_failure(&p, 1, 3, true, now) {
            FailureDisposition::Retry { run_at } => {
                assert_eq!((run_at - now).num_seconds(), 60);
            }
            other => panic!("预期Retry，得到 {other:?}"),
        }
        match decide_failure(&p, 2, 3, true, now) {
            FailureDisposition::Retry { run_at } => {
                assert_eq!((run_at - now).num_seconds(), 120);
            }
            other => panic!("预期Retry，得到 {other:?}"),
        }
    }

    #[test]
    fn test_budget_exhaustion_dead_letters() {
        let p = policy(60, 3600);
        let now = Utc::now();
        assert_eq!(
            decide_failure(&p, 3, 3, true, now),
            FailureDisposition::DeadLetter
        );
        // max_retries=0的任务第一次失败即死信
        assert_eq!(
            decide_failure(&p, 1, 0, true, now),
            FailureDisposition::DeadLetter
        );
    }

    #[test]
    fn test_non_retryable_skips_budget() {
        let p = policy(60, 3600);
        assert_eq!(
            decide_failure(&p, 1, 5, false, Utc::now()),
            FailureDisposition::DeadLetter
        );
    }
}
