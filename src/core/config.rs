//! Purpose: Build the module readiness configuration once, from explicit inputs.
//! Exports: `ModuleConfig`, `DEFAULT_MODULE`, `DEFAULT_TIMEOUT_SECS`, `MAX_TIMEOUT_SECS`.
//! Role: The only place that reads `ZFS_MODULE_LOADING` / `ZFS_MODULE_TIMEOUT`.
//! Invariants: Algorithms receive a `ModuleConfig`; they never consult the environment.
//! Invariants: `timeout_seconds` is always within `0..=MAX_TIMEOUT_SECS`.

use std::time::Duration;

use crate::core::module::WaitPolicy;

pub const DEFAULT_MODULE: &str = "zfs";
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const MAX_TIMEOUT_SECS: u64 = 10 * 60;

pub const LOADING_ENV: &str = "ZFS_MODULE_LOADING";
pub const TIMEOUT_ENV: &str = "ZFS_MODULE_TIMEOUT";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModuleConfig {
    pub module_name: String,
    pub load_enabled: bool,
    pub timeout_seconds: u64,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            module_name: DEFAULT_MODULE.to_string(),
            load_enabled: false,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl ModuleConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = lookup(LOADING_ENV) {
            config.load_enabled = loading_enabled(&value);
        }
        if let Some(value) = lookup(TIMEOUT_ENV) {
            config.timeout_seconds = clamp_timeout(parse_c_long(&value));
        }
        config
    }

    pub fn with_module(mut self, module_name: impl Into<String>) -> Self {
        self.module_name = module_name.into();
        self
    }

    pub fn with_loading(mut self, load_enabled: bool) -> Self {
        self.load_enabled = load_enabled;
        self
    }

    pub fn with_timeout(mut self, seconds: i64) -> Self {
        self.timeout_seconds = clamp_timeout(seconds);
        self
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy::new(self.load_enabled, Duration::from_secs(self.timeout_seconds))
    }
}

pub fn clamp_timeout(seconds: i64) -> u64 {
    seconds.clamp(0, MAX_TIMEOUT_SECS as i64) as u64
}

/// `YES` or `ON` as a case-insensitive prefix; anything else disables loading.
fn loading_enabled(value: &str) -> bool {
    let value = value.as_bytes();
    [b"YES".as_slice(), b"ON".as_slice()]
        .iter()
        .any(|word| value.len() >= word.len() && value[..word.len()].eq_ignore_ascii_case(word))
}

/// Integer parsing with `strtol(s, NULL, 0)` semantics: leading whitespace,
/// optional sign, `0x` hex or leading-`0` octal, longest valid prefix, and 0
/// when nothing parses. Saturates instead of overflowing.
fn parse_c_long(input: &str) -> i64 {
    let mut rest = input.trim_start();
    let negative = match rest.as_bytes().first() {
        Some(b'-') => {
            rest = &rest[1..];
            true
        }
        Some(b'+') => {
            rest = &rest[1..];
            false
        }
        _ => false,
    };

    let lower = rest.get(..2).map(str::to_ascii_lowercase);
    let (radix, digits) = if lower.as_deref() == Some("0x")
        && rest[2..].chars().next().is_some_and(|c| c.is_ascii_hexdigit())
    {
        (16, &rest[2..])
    } else if rest.starts_with('0') {
        (8, rest)
    } else {
        (10, rest)
    };

    let mut value: i64 = 0;
    for c in digits.chars() {
        let Some(digit) = c.to_digit(radix) else {
            break;
        };
        value = value.saturating_mul(radix as i64).saturating_add(digit as i64);
    }
    if negative { value.saturating_neg() } else { value }
}
