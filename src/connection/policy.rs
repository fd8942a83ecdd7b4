//! 重连策略：由（已重试次数，断开原因）计算是否重试与退避时长
//!
//! delay = min(max, base × 2^attempts) + jitter，jitter ∈ [0, jitter_ms)。
//! 计数只在成功连上时清零，连续失败沿用同一条退避序列。

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::config::ReconnectSection;
use crate::engine::CloseReason;

/// 断开原因分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectCause {
    /// 会话被显式结束（运营方或远端），不自动重试
    LoggedOut,
    /// 网络 / 服务端关闭，可按策略重试
    Transient,
}

impl DisconnectCause {
    pub fn classify(reason: &CloseReason) -> Self {
        if reason.is_logged_out() {
            DisconnectCause::LoggedOut
        } else {
            DisconnectCause::Transient
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectCause::LoggedOut => "logged_out",
            DisconnectCause::Transient => "transient",
        }
    }
}

/// 一次策略判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay: Duration,
    /// 若重试，这是第几次（从 1 开始）
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
    pub jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            max: Duration::from_millis(30_000),
            max_attempts: 5,
            jitter: Duration::from_millis(500),
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(section: &ReconnectSection) -> Self {
        Self {
            base: Duration::from_millis(section.base_ms),
            max: Duration::from_millis(section.max_ms),
            max_attempts: section.max_attempts,
            jitter: Duration::from_millis(section.jitter_ms),
        }
    }

    /// 不含抖动的退避：min(max, base × 2^attempts)，溢出按 max 处理
    pub fn backoff(&self, attempts: u32) -> Duration {
        let base = self.base.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        let scaled = 2u64
            .checked_pow(attempts)
            .and_then(|factor| base.checked_mul(factor))
            .unwrap_or(max);
        Duration::from_millis(scaled.min(max))
    }

    /// 纯函数版本，抖动由调用方给出
    pub fn decide(&self, attempts: u32, cause: DisconnectCause, jitter: Duration) -> RetryDecision {
        let attempt = attempts.saturating_add(1);
        if cause == DisconnectCause::LoggedOut || attempts >= self.max_attempts {
            return RetryDecision {
                should_retry: false,
                delay: Duration::ZERO,
                attempt,
            };
        }
        RetryDecision {
            should_retry: true,
            delay: self.backoff(attempts) + jitter,
            attempt,
        }
    }

    /// 带随机抖动的判定
    pub fn evaluate(&self, attempts: u32, cause: DisconnectCause) -> RetryDecision {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        };
        self.decide(attempts, cause, jitter)
    }
}
