// Copyright 2025 Rockchip Electronics Co., Ltd.
// SPDX-License-Identifier: Apache-2.0

//! Process-environment switches.
//!
//! The components read a handful of boolean properties at runtime. Every
//! switch defaults to "off" when the variable is absent or unparseable, so a
//! stripped environment always yields production behavior.

use std::env;

/// Enables bitstream/frame dumping in the dump service.
pub const DEBUG_DUMP: &str = "C2_RK_DEBUG_DUMP";
/// Performance mode: tightens the engine input timeout so the worker
/// polls output more aggressively.
pub const PERF_PIN: &str = "C2_RK_PERF_PIN";
/// Forces low-memory mode regardless of the configured parameter.
pub const LOW_MEMORY: &str = "C2_RK_LOW_MEMORY";
/// Enables the in-hardware scaling (thumbnail) feature.
pub const SCALE_ENABLE: &str = "C2_RK_SCALE_ENABLE";

pub fn bool_prop(name: &str) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.trim(), "1" | "true" | "y" | "on"),
        Err(_) => false,
    }
}

pub fn u32_prop(name: &str, default: u32) -> u32 {
    env::var(name).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
