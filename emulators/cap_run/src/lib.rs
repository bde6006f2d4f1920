//! JSON front end for the Morello core: seed registers and memory, run a
//! decoded program, report the final machine state.

use morello_core::{
    BoundsStats, CapRuntime, CapState, CompressedCap, CoreConfig, Instr, MemoryImage, RunReport,
};
use serde::{Deserialize, Serialize};

fn default_max_steps() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CapInit {
    pub addr: u64,
    pub cap: CompressedCap,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Input {
    #[serde(default)]
    pub config: Option<CoreConfig>,
    #[serde(default)]
    pub state: Option<CapState>,
    /// Byte preloads as `(address, value)`.
    #[serde(default)]
    pub memory: Vec<(u64, u8)>,
    #[serde(default)]
    pub caps: Vec<CapInit>,
    pub program: Vec<Instr>,
    /// Address of `program[0]`; defaults to the PCC cursor of `state`.
    #[serde(default)]
    pub entry: Option<u64>,
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Output {
    pub report: RunReport,
    pub state: CapState,
    pub memory: Vec<(u64, u8)>,
    pub tags: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<String>,
}

pub fn preload(memory: &mut MemoryImage, input: &Input) {
    for &(addr, value) in &input.memory {
        memory.write_bytes(addr, &[value]);
    }
    for init in &input.caps {
        memory.store_cap(init.addr, init.cap);
    }
}

fn dump_memory(memory: &MemoryImage) -> Vec<(u64, u8)> {
    memory
        .segments()
        .into_iter()
        .flat_map(|(base, bytes)| {
            bytes
                .into_iter()
                .enumerate()
                .filter(|(_, b)| *b != 0)
                .map(move |(i, b)| (base + i as u64, b))
        })
        .collect()
}

/// Runs `input` on a fresh runtime built from `config`.
pub fn run(input: &Input, config: CoreConfig, with_stats: bool) -> Output {
    run_on(input, config, MemoryImage::new(), with_stats)
}

/// Like [`run`], with the input's preloads applied on top of `memory`.
pub fn run_on(input: &Input, config: CoreConfig, memory: MemoryImage, with_stats: bool) -> Output {
    let mut rt = CapRuntime::new(config);
    rt.memory = memory;
    if let Some(state) = &input.state {
        rt.state = state.clone();
    }
    if let Some(entry) = input.entry {
        rt.state.set_pc(entry);
    }
    let entry = rt.state.pc();
    preload(&mut rt.memory, input);

    if with_stats {
        let mut rt = rt.with_observer(BoundsStats::new());
        let report = rt.run(&input.program, entry, input.max_steps);
        let stats = rt.observer().report();
        finish(report, rt.state, &rt.memory, Some(stats))
    } else {
        let report = rt.run(&input.program, entry, input.max_steps);
        finish(report, rt.state, &rt.memory, None)
    }
}

fn finish(
    report: RunReport,
    state: CapState,
    memory: &MemoryImage,
    stats: Option<String>,
) -> Output {
    Output {
        report,
        state,
        memory: dump_memory(memory),
        tags: memory.dump_tags(),
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use morello_core::{CapReg, StopReason};

    #[test]
    fn json_program_runs_to_completion() {
        let text = r#"{
            "entry": 4096,
            "memory": [[8192, 171]],
            "program": [
                {"op": "ScValue", "rd": 1, "rn": 31, "rm": 2},
                {"op": "Aldr", "rd": 3, "rn": 2, "size": 0, "mods": "ALTERNATE"}
            ]
        }"#;
        let mut input: Input = serde_json::from_str(text).unwrap();
        let mut state = CapState::new();
        state.csp = morello_core::Capability::root();
        state.set_x(CapReg::C(2), 0x2000);
        input.state = Some(state);
        let out = run(&input, CoreConfig::default(), true);
        assert_eq!(out.report.stop, StopReason::Halted);
        assert_eq!(out.state.x(CapReg::C(3)), 0xab);
        assert!(out.stats.is_some());
        assert_eq!(out.memory, vec![(0x2000, 0xab)]);
    }
}
