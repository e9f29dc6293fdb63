//! # dotnet-stubs
//!
//! Runtime-generated virtual dispatch stubs and write barrier patching for a
//! managed runtime, running on a small simulated machine.
//!
//! A virtual call site is an indirection cell that holds the address of a
//! lookup, dispatch or resolve stub ([`stubs`]); [`resolver::StubManager`]
//! moves cells between those states as the site's receiver types change.
//! [`write_barrier`] keeps the GC globals embedded in barrier code current.
//! Generated code is real code for one of two encodings ([`arch`]) and is
//! executed by [`machine::Machine`].
use clap::Parser;
use serde::Serialize;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

pub mod arch;
pub mod assembler;
pub mod code_heap;
pub mod config;
pub mod error;
pub mod execution_control;
pub mod machine;
pub mod memory;
pub mod metrics;
pub mod resolve_cache;
pub mod resolver;
pub mod runtime;
pub mod stubs;
pub mod sync;
pub mod threading;
pub mod types;
pub mod unwind;
pub mod write_barrier;

use arch::IsaKind;
use config::StubConfig;
use error::StubError;
use metrics::MetricsSnapshot;
use runtime::Runtime;
use unwind::UnwindMode;
use write_barrier::{BarrierKind, BarrierVariant};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Virtual dispatch stubs and write barrier patching on a simulated machine"
)]
pub struct Args {
    #[arg(long, value_enum)]
    pub isa: Option<IsaKind>,
    #[arg(long)]
    pub cache_bits: Option<u32>,
    #[arg(long)]
    pub promote_after: Option<u32>,
    #[arg(long)]
    pub downgrade_streak: Option<u32>,
    #[arg(long, value_enum)]
    pub unwind: Option<UnwindMode>,
    #[arg(long)]
    pub write_watch: bool,
    #[arg(long)]
    pub processors: Option<usize>,
    /// Receiver types the demo call site sees.
    #[arg(long, default_value_t = 3)]
    pub types: usize,
    #[arg(long, default_value_t = 1000)]
    pub calls: usize,
    /// Print the report as JSON.
    #[arg(long)]
    pub json: bool,
}

impl Args {
    pub fn apply(&self, config: &mut StubConfig) {
        if let Some(isa) = self.isa {
            config.isa = isa;
        }
        if let Some(bits) = self.cache_bits {
            config.cache_bits = bits;
        }
        if let Some(n) = self.promote_after {
            config.promote_after = n;
        }
        if let Some(n) = self.downgrade_streak {
            config.downgrade_streak = n;
        }
        if let Some(mode) = self.unwind {
            config.unwind_mode = mode;
        }
        if self.write_watch {
            config.software_write_watch = true;
        }
        if let Some(n) = self.processors {
            config.processor_count = n;
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ScenarioReport {
    pub calls: usize,
    pub wrong_targets: usize,
    pub final_site_state: String,
    pub barrier_variant: Option<BarrierVariant>,
    pub metrics: MetricsSnapshot,
}

/// One call site fed a monomorphic phase then a round-robin phase, followed
/// by a heap growth the write barriers have to follow.
pub fn run_scenario(runtime: &Runtime, types: usize, calls: usize) -> Result<ScenarioReport, StubError> {
    let token = runtime.types.new_token();
    let mut receivers = Vec::new();
    for i in 0..types.max(1) {
        let ty = runtime.types.define_type(&format!("Type{i}"), None, 2)?;
        let body = runtime.types.implement(ty, token, &format!("Type{i}.Invoke"))?;
        receivers.push((runtime.types.allocate_object(ty)?, body));
    }

    let site = runtime.stubs.prepare_call_site(token)?;
    let mut wrong_targets = 0;
    for i in 0..calls {
        let (receiver, body) = if i < calls / 2 {
            receivers[0]
        } else {
            receivers[i % receivers.len()]
        };
        let invocation = runtime.stubs.invoke(&site, receiver, &[i as u64])?;
        if invocation.target != body {
            wrong_targets += 1;
        }
    }

    let slot = runtime.memory.allocate_data(8, 8)?;
    runtime
        .barriers
        .execute(BarrierKind::Write, slot, receivers[0].0.as_u64())?;
    let mut bounds = runtime.barriers.bounds();
    bounds.highest = bounds.highest + (1 << write_barrier::WRITE_WATCH_SHIFT);
    runtime.barriers.on_heap_bounds_changed(bounds)?.finish();

    Ok(ScenarioReport {
        calls,
        wrong_targets,
        final_site_state: format!("{:?}", runtime.stubs.site_state(site.cell)?),
        barrier_variant: runtime.barriers.active_variant(BarrierKind::Write),
        metrics: runtime.metrics(),
    })
}

pub fn run_cli() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = StubConfig::from_env();
    args.apply(&mut config);

    let runtime = match Runtime::new(config) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error initializing runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    let report = match run_scenario(&runtime, args.types, args.calls) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Scenario failed: {}", e);
            return ExitCode::from(1);
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error serializing report: {}", e);
                return ExitCode::from(1);
            }
        }
    } else {
        println!("Calls:            {}", report.calls);
        println!("Wrong targets:    {}", report.wrong_targets);
        println!("Final site state: {}", report.final_site_state);
        if let Some(variant) = report.barrier_variant {
            println!("Write barrier:    {:?}", variant.flavor);
        }
        print!("{}", report.metrics);
    }

    if report.wrong_targets == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    }
}
