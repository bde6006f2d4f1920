use crate::{CoreError, Result};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

bitflags! {
    /// Capability control register bits consulted by the engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Cctlr: u32 {
        /// Integer branch targets and CVT results are offset by PCC.base.
        const PCCBO = 1 << 0;
        /// Integer addresses and CVT results are offset by DDC.base.
        const DDCBO = 1 << 1;
        /// ADRDP derives from C28 instead of DDC.
        const ADRDPB = 1 << 2;
        /// Link registers are sealed as sentries.
        const SBL = 1 << 3;
    }
}

impl Default for Cctlr {
    fn default() -> Self {
        Cctlr::SBL
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default = "default_true")]
    pub capabilities_enabled: bool,
    #[serde(default)]
    pub cctlr: Cctlr,
    /// Current exception level.
    #[serde(default)]
    pub el: u8,
    /// SCTAG/STCT are inhibited at the current level.
    #[serde(default)]
    pub tag_setting_disabled: bool,
    /// Integer accesses need natural alignment everywhere, not only for atomics.
    #[serde(default)]
    pub strict_alignment: bool,
    /// Memory accesses based on CSP need a 16-byte aligned CSP.
    #[serde(default)]
    pub sp_alignment_check: bool,
    /// Raise a fault instead of clearing the tag when a cursor becomes unrepresentable.
    #[serde(default)]
    pub fault_on_unrepresentable: bool,
    /// Load-and-branch skips writing the unsealed base back when Cn is 31.
    #[serde(default)]
    pub keep_branch_and_link_bug: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            capabilities_enabled: true,
            cctlr: Cctlr::default(),
            el: 0,
            tag_setting_disabled: false,
            strict_alignment: false,
            sp_alignment_check: false,
            fault_on_unrepresentable: false,
            keep_branch_and_link_bug: false,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    match env::var(name).as_deref() {
        Ok("1") | Ok("true") | Ok("True") => Some(true),
        Ok("0") | Ok("false") | Ok("False") => Some(false),
        _ => None,
    }
}

impl CoreConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: CoreConfig = serde_json::from_str(text)?;
        if config.el > 3 {
            return Err(CoreError::Config(format!("exception level {} out of range", config.el)));
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Applies `MORELLO_*` environment overrides on top of `self`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(value) = env_flag("MORELLO_KEEP_BRANCH_AND_LINK_BUG") {
            self.keep_branch_and_link_bug = value;
        }
        if let Some(value) = env_flag("MORELLO_STRICT_ALIGNMENT") {
            self.strict_alignment = value;
        }
        if let Some(value) = env_flag("MORELLO_FAULT_ON_UNREPRESENTABLE") {
            self.fault_on_unrepresentable = value;
        }
        self
    }

    pub fn pcc_base_offset(&self) -> bool {
        self.cctlr.contains(Cctlr::PCCBO)
    }

    pub fn ddc_base_offset(&self) -> bool {
        self.cctlr.contains(Cctlr::DDCBO)
    }

    pub fn sentry_links(&self) -> bool {
        self.cctlr.contains(Cctlr::SBL)
    }
}
