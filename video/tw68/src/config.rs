// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Driver configuration from the environment

use std::time::Duration;

use log::warn;

use crate::format::{norm_by_name, Norm, StdId, NORMS};
use crate::risc::LineOffset;

/// Driver configuration
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Board number overriding subsystem-ID detection
    pub card: Option<usize>,
    /// Capture memory limit per handle, in MiB
    pub vid_limit_mb: usize,
    /// A running chain that completes nothing for this long is recovered
    pub buffer_timeout: Duration,
    /// Norm selected at probe
    pub norm: &'static Norm,
    /// Status re-reads per interrupt before masking everything
    pub irq_loop_limit: u32,
    pub line_offset: LineOffset,
    /// Period of the timeout watchdog thread
    pub watchdog_interval: Duration,
    /// Delay after the decoder soft reset
    pub reset_settle: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            card: None,
            vid_limit_mb: 16,
            buffer_timeout: Duration::from_millis(500),
            norm: NORMS.iter().find(|n| n.std == StdId::PAL_M).unwrap_or(&NORMS[0]),
            irq_loop_limit: 10,
            line_offset: LineOffset::Omit,
            watchdog_interval: Duration::from_millis(20),
            reset_settle: Duration::from_millis(100),
        }
    }
}

impl DriverConfig {
    /// Read `TW68_*` variables over the defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unparsable values keep the default
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = lookup("TW68_CARD") {
            if let Ok(n) = val.parse() {
                config.card = Some(n);
            }
        }

        if let Some(val) = lookup("TW68_VID_LIMIT") {
            if let Ok(n) = val.parse() {
                config.vid_limit_mb = n;
            }
        }

        if let Some(val) = lookup("TW68_BUFFER_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                config.buffer_timeout = Duration::from_millis(ms);
            }
        }

        if let Some(val) = lookup("TW68_NORM") {
            match norm_by_name(&val) {
                Some(norm) => config.norm = norm,
                None => warn!("tw68: unknown norm {:?}, keeping {}", val, config.norm.name),
            }
        }

        if let Some(val) = lookup("TW68_IRQ_LOOP_LIMIT") {
            if let Ok(n) = val.parse::<u32>() {
                config.irq_loop_limit = n.max(1);
            }
        }

        if let Some(val) = lookup("TW68_RISC_LINE_OFFSET") {
            config.line_offset = if val == "1" || val.to_lowercase() == "true" {
                LineOffset::Encode
            } else {
                LineOffset::Omit
            };
        }

        if let Some(val) = lookup("TW68_WATCHDOG_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.watchdog_interval = Duration::from_millis(ms.max(1));
            }
        }

        if let Some(val) = lookup("TW68_RESET_SETTLE_MS") {
            if let Ok(ms) = val.parse() {
                config.reset_settle = Duration::from_millis(ms);
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.norm.name, "PAL-M");
        assert_eq!(config.vid_limit_mb, 16);
        assert_eq!(config.irq_loop_limit, 10);
        assert_eq!(config.line_offset, LineOffset::Omit);
    }

    #[test]
    fn test_overrides() {
        let config = DriverConfig::from_lookup(lookup(&[
            ("TW68_CARD", "1"),
            ("TW68_NORM", "secam"),
            ("TW68_BUFFER_TIMEOUT_MS", "250"),
            ("TW68_RISC_LINE_OFFSET", "true"),
            ("TW68_IRQ_LOOP_LIMIT", "0"),
        ]));
        assert_eq!(config.card, Some(1));
        assert_eq!(config.norm.name, "SECAM");
        assert_eq!(config.buffer_timeout, Duration::from_millis(250));
        assert_eq!(config.line_offset, LineOffset::Encode);
        assert_eq!(config.irq_loop_limit, 1);
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let config = DriverConfig::from_lookup(lookup(&[("TW68_VID_LIMIT", "lots"), ("TW68_NORM", "MAC")]));
        assert_eq!(config.vid_limit_mb, 16);
        assert_eq!(config.norm.name, "PAL-M");
    }
}
