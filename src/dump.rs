// Copyright 2025 Rockchip Electronics Co., Ltd.
// SPDX-License-Identifier: Apache-2.0

//! Debug dump service.
//!
//! Every running component registers a node here; the host-side debug
//! shell calls [`DumpStateService::dump`] to print a one-line summary per
//! node or to flip the global debug flags at runtime. Flags can also be
//! seeded through the [`crate::properties::DEBUG_DUMP`] switch at process
//! start.

use std::collections::HashMap;
use std::io;
use std::io::Write;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::Weak;

use crate::properties;
use crate::Resolution;

/// Record the input bitstream of every node to disk.
pub const FLAG_DUMP_INPUT: u32 = 1 << 0;
/// Record decoded/encoded output payloads to disk.
pub const FLAG_DUMP_OUTPUT: u32 = 1 << 1;
/// Log a frame-rate line once per second per node.
pub const FLAG_LOG_FPS: u32 = 1 << 2;

const USAGE: &str = "usage: dump [-flags <value>]  (value accepts decimal, 0x hex or 0 octal)\n";

/// Per-component counters, updated lock-free from the worker thread.
pub struct DumpNode {
    name: String,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    width: AtomicU32,
    height: AtomicU32,
}

impl DumpNode {
    fn new(name: String) -> Self {
        Self {
            name,
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            width: AtomicU32::new(0),
            height: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record_input(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_output(&self) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_size(&self, size: Resolution) {
        self.width.store(size.width, Ordering::Relaxed);
        self.height.store(size.height, Ordering::Relaxed);
    }
}

/// Integer parse with the C `strtol(value, NULL, 0)` base rules: `0x`
/// prefix is hex, a leading `0` is octal, anything else decimal. The whole
/// token must parse.
fn parse_flag(token: &str) -> Option<u32> {
    let (negative, digits) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token.strip_prefix('+').unwrap_or(token)),
    };
    let value = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16).ok()?
    } else if digits.len() > 1 && digits.starts_with('0') {
        i64::from_str_radix(&digits[1..], 8).ok()?
    } else {
        digits.parse::<i64>().ok()?
    };
    Some(if negative { -value } else { value } as u32)
}

pub struct DumpStateService {
    flags: AtomicU32,
    next_instance: AtomicU32,
    nodes: Mutex<HashMap<String, Weak<DumpNode>>>,
}

impl DumpStateService {
    pub fn new() -> Self {
        Self {
            flags: AtomicU32::new(properties::u32_prop(properties::DEBUG_DUMP, 0)),
            next_instance: AtomicU32::new(1),
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Process-wide service instance.
    pub fn get() -> Arc<DumpStateService> {
        static SERVICE: OnceLock<Arc<DumpStateService>> = OnceLock::new();
        SERVICE.get_or_init(|| Arc::new(DumpStateService::new())).clone()
    }

    /// Registers a component under `<name>#<instance>`. The node
    /// deregisters itself by being dropped.
    pub fn register(&self, name: &str) -> Arc<DumpNode> {
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let node_name = format!("{name}#{instance}");
        let node = Arc::new(DumpNode::new(node_name.clone()));
        self.nodes.lock().unwrap().insert(node_name, Arc::downgrade(&node));
        node
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Relaxed)
    }

    pub fn set_flags(&self, flags: u32) {
        self.flags.store(flags, Ordering::Relaxed);
    }

    /// Shell entry point. Without arguments prints the node summary;
    /// `-flags <value>` updates the debug flags. A value that does not
    /// parse leaves the flags untouched and prints the usage text.
    pub fn dump(&self, args: &[&str], out: &mut dyn Write) -> io::Result<()> {
        match args {
            [] => self.dump_summary(out),
            ["-flags", value] | ["--flags", value] => match parse_flag(value) {
                Some(flags) => {
                    self.set_flags(flags);
                    writeln!(out, "debug flags set to {flags:#x}")
                }
                None => out.write_all(USAGE.as_bytes()),
            },
            _ => out.write_all(USAGE.as_bytes()),
        }
    }

    fn dump_summary(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "rk-codec2 dump state: flags={:#x}", self.flags())?;
        let mut nodes = self.nodes.lock().unwrap();
        nodes.retain(|_, weak| weak.strong_count() > 0);
        let mut names: Vec<&String> = nodes.keys().collect();
        names.sort();
        for name in names {
            if let Some(node) = nodes[name].upgrade() {
                writeln!(
                    out,
                    "  {}: in={} out={} size={}x{}",
                    node.name,
                    node.frames_in.load(Ordering::Relaxed),
                    node.frames_out.load(Ordering::Relaxed),
                    node.width.load(Ordering::Relaxed),
                    node.height.load(Ordering::Relaxed),
                )?;
            }
        }
        Ok(())
    }
}

impl Default for DumpStateService {
    fn default() -> Self {
        Self::new()
    }
}
