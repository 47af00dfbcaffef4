//! Retry policy for delegated attempts

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tandem_foundation::DelegationSettings;

/// 백오프 방식
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryBackoff {
    /// 매번 같은 대기
    Fixed { delay_ms: u64 },

    /// base + step * (n - 1)
    Linear {
        base_ms: u64,
        step_ms: u64,
        max_ms: u64,
    },

    /// min(base * 2^(n - 1), max)
    Exponential { base_ms: u64, max_ms: u64 },
}

impl RetryBackoff {
    /// 대기 시간 (jitter 제외). `failed_attempts` is 1 after the first failure.
    pub fn base_delay(&self, failed_attempts: u32) -> Duration {
        let n = failed_attempts.max(1) - 1;
        let ms = match *self {
            Self::Fixed { delay_ms } => delay_ms,
            Self::Linear {
                base_ms,
                step_ms,
                max_ms,
            } => base_ms
                .saturating_add(step_ms.saturating_mul(n as u64))
                .min(max_ms),
            Self::Exponential { base_ms, max_ms } => {
                let factor = 1u64.checked_shl(n).unwrap_or(u64::MAX);
                base_ms.saturating_mul(factor).min(max_ms)
            }
        };
        Duration::from_millis(ms)
    }
}

/// Retry 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// 최대 시도 횟수 (첫 시도 포함)
    pub max_attempts: u32,

    pub backoff: RetryBackoff,

    /// 추가 jitter 비율 (0.0 - 1.0). 대기 시간에 [0, jitter * delay] 가 더해집니다.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&DelegationSettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &DelegationSettings) -> Self {
        Self {
            max_attempts: settings.default_max_attempts.max(1),
            backoff: RetryBackoff::Exponential {
                base_ms: settings.backoff_base_ms,
                max_ms: settings.backoff_max_ms,
            },
            jitter: settings.jitter.clamp(0.0, 1.0),
        }
    }

    /// 재시도 없음
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: RetryBackoff::Fixed { delay_ms: 0 },
            jitter: 0.0,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: RetryBackoff::Fixed {
                delay_ms: delay.as_millis() as u64,
            },
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: RetryBackoff::Exponential {
                base_ms: base.as_millis() as u64,
                max_ms: max.as_millis() as u64,
            },
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Whether another attempt is allowed after `failed_attempts` failures
    pub fn allows_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.max_attempts
    }

    /// n번째 실패 후 대기 시간 (jitter 포함)
    pub fn delay_for_attempt(&self, failed_attempts: u32) -> Duration {
        let factor = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.jitter)
        } else {
            0.0
        };
        self.delay_with_factor(failed_attempts, factor)
    }

    /// Deterministic form: `factor` is the jitter fraction actually applied
    pub fn delay_with_factor(&self, failed_attempts: u32, factor: f64) -> Duration {
        let base = self.backoff.base_delay(failed_attempts);
        base + base.mul_f64(factor.clamp(0.0, self.jitter))
    }
}
