//! Runtime tuning for the stub subsystem.
//!
//! Values come from [`StubConfig::default`], then `DOTNET_STUBS_*` environment
//! variables, then command line flags (see `main.rs`).
use crate::{arch::IsaKind, unwind::UnwindMode};
use serde::Serialize;
use std::{env, str::FromStr};
use tracing::warn;

pub const MAX_CACHE_BITS: u32 = 20;

#[derive(Debug, Clone, Serialize)]
pub struct StubConfig {
    /// Instruction encoding stubs are emitted in.
    pub isa: IsaKind,
    /// The shared resolve cache has `1 << cache_bits` buckets.
    pub cache_bits: u32,
    /// Dispatch-stub misses tolerated before the call site is promoted to its resolve stub.
    pub promote_after: u32,
    /// Consecutive cache hits on one type before a resolve stub asks to be downgraded.
    pub downgrade_streak: u32,
    /// Map code pages twice (RX and RW) instead of once RWX.
    pub write_xor_execute: bool,
    pub unwind_mode: UnwindMode,
    /// Emit write barriers that also dirty the software write-watch table.
    pub software_write_watch: bool,
    pub data_heap_bytes: u64,
    pub code_heap_bytes: u64,
    /// Instructions a single simulated call may execute before faulting.
    pub step_limit: u64,
    pub processor_count: usize,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            isa: IsaKind::Narrow,
            cache_bits: 12,
            promote_after: 100,
            downgrade_streak: 256,
            write_xor_execute: true,
            unwind_mode: UnwindMode::Live,
            software_write_watch: false,
            data_heap_bytes: 16 << 20,
            code_heap_bytes: 1 << 20,
            step_limit: 10_000,
            processor_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => {
            warn!(variable = name, value = %raw, "ignoring unparsable environment flag");
            None
        }
    }
}

impl StubConfig {
    /// Defaults overridden by `DOTNET_STUBS_*` variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(isa) = env::var("DOTNET_STUBS_ISA") {
            match isa.to_lowercase().as_str() {
                "narrow" => config.isa = IsaKind::Narrow,
                "wide" => config.isa = IsaKind::Wide,
                _ => warn!(value = %isa, "unknown DOTNET_STUBS_ISA"),
            }
        }
        if let Ok(mode) = env::var("DOTNET_STUBS_UNWIND") {
            match mode.to_lowercase().as_str() {
                "live" => config.unwind_mode = UnwindMode::Live,
                "diagnostic" => config.unwind_mode = UnwindMode::Diagnostic,
                _ => warn!(value = %mode, "unknown DOTNET_STUBS_UNWIND"),
            }
        }
        if let Some(bits) = env_value("DOTNET_STUBS_CACHE_BITS") {
            config.cache_bits = bits;
        }
        if let Some(n) = env_value("DOTNET_STUBS_PROMOTE_AFTER") {
            config.promote_after = n;
        }
        if let Some(n) = env_value("DOTNET_STUBS_DOWNGRADE_STREAK") {
            config.downgrade_streak = n;
        }
        if let Some(wx) = env_flag("DOTNET_STUBS_WX") {
            config.write_xor_execute = wx;
        }
        if let Some(ww) = env_flag("DOTNET_STUBS_WRITE_WATCH") {
            config.software_write_watch = ww;
        }
        if let Some(n) = env_value("DOTNET_STUBS_DATA_HEAP") {
            config.data_heap_bytes = n;
        }
        if let Some(n) = env_value("DOTNET_STUBS_CODE_HEAP") {
            config.code_heap_bytes = n;
        }
        if let Some(n) = env_value("DOTNET_STUBS_STEP_LIMIT") {
            config.step_limit = n;
        }
        if let Some(n) = env_value("DOTNET_STUBS_PROCESSORS") {
            config.processor_count = n;
        }

        config.sanitized()
    }

    /// Clamp values the runtime cannot honour.
    pub fn sanitized(mut self) -> Self {
        if self.cache_bits == 0 || self.cache_bits > MAX_CACHE_BITS {
            let clamped = self.cache_bits.clamp(1, MAX_CACHE_BITS);
            warn!(requested = self.cache_bits, clamped, "resolve cache size out of range");
            self.cache_bits = clamped;
        }
        if self.processor_count == 0 {
            self.processor_count = 1;
        }
        if self.step_limit == 0 {
            self.step_limit = Self::default().step_limit;
        }
        self
    }

    pub fn cache_buckets(&self) -> u64 {
        1 << self.cache_bits
    }

    pub fn cache_mask(&self) -> u64 {
        self.cache_buckets() - 1
    }
}
