use serde::{Deserialize, Serialize};
use std::fmt;

use crate::manifest::{ReadinessStatus, SkillManifest, SkillReadiness};

/// Risk tier for a skill — controls permission prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskTier {
    Pure,
    Io,
    Net,
    Admin,
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskTier::Pure => write!(f, "PURE"),
            RiskTier::Io => write!(f, "IO"),
            RiskTier::Net => write!(f, "NET"),
            RiskTier::Admin => write!(f, "ADMIN"),
        }
    }
}

/// A skill loaded either from a legacy `skill.toml` (all fields populated
/// directly) or from a `SKILL.md` YAML-frontmatter `SkillManifest` (the
/// render fields are derived from the manifest at load time). Both
/// `registry.rs` and `loader.rs` assume a unified shape with `manifest`,
/// `readiness`, and `is_ready()` — this is that unified shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillEntry {
    pub name: String,
    pub description: String,
    pub location: String,
    pub risk: RiskTier,
    #[serde(default)]
    pub inputs: Option<String>,
    #[serde(default)]
    pub outputs: Option<String>,
    #[serde(default)]
    pub permission_scope: Option<String>,
    /// Present when this entry came from a `SKILL.md` manifest (or a
    /// `skill.toml` with `requires`/`install` sections); absent for a bare
    /// legacy entry with no readiness-checkable requirements.
    #[serde(skip)]
    pub manifest: Option<SkillManifest>,
    /// Computed once at load/reload time from `manifest.check_readiness()`.
    /// Absent means "no requirements to check" — treated as ready.
    #[serde(skip)]
    pub readiness: Option<SkillReadiness>,
}

impl SkillEntry {
    pub fn render_index_line(&self) -> String {
        let mut line = format!("- {}: {}", self.name, self.description);
        line.push_str(&format!(" location={}", self.location));
        line.push_str(&format!(" risk={}", self.risk));
        if let Some(ref inputs) = self.inputs {
            line.push_str(&format!(" inputs={inputs}"));
        }
        if let Some(ref outputs) = self.outputs {
            line.push_str(&format!(" outputs={outputs}"));
        }
        line
    }

    /// Ready when there's no readiness check to fail, or the check passed.
    pub fn is_ready(&self) -> bool {
        match &self.readiness {
            None => true,
            Some(r) => r.status == ReadinessStatus::Ready,
        }
    }
}
