use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Target architecture a seed is compiled for.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    #[serde(rename = "x86-64")]
    X86_64,
    #[serde(rename = "aarch64")]
    Aarch64,
    #[serde(rename = "riscv64")]
    Riscv64,
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Arch::X86_64 => "x86-64",
            Arch::Aarch64 => "aarch64",
            Arch::Riscv64 => "riscv64",
        };
        write!(f, "{label}")
    }
}

/// Closed set of corruption strategies a seed program can embody.
///
/// The tag drives two things: which argument shape the compiled candidate
/// expects on its command line, and which severity-ordering assumptions the
/// search engine may rely on. It is deliberately a closed enum rather than a
/// free-form string.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum CorruptionPattern {
    FixedArray,
    Vla,
    Alloca,
    StructUnion,
    FormatString,
    LongjmpBypass,
}

impl CorruptionPattern {
    /// Patterns whose stack allocation is sized at runtime. These candidates
    /// take `<buf_size> <fill_size>`; everything else takes `<fill_size>`.
    pub fn takes_alloc_size(&self) -> bool {
        matches!(self, CorruptionPattern::Vla | CorruptionPattern::Alloca)
    }

    /// Whether this pattern is a dynamic allocation strategy for the purpose
    /// of bypass-signature attribution (VLA, `alloca`).
    pub fn is_dynamic_alloc(&self) -> bool {
        self.takes_alloc_size()
    }

    pub fn label(&self) -> &'static str {
        match self {
            CorruptionPattern::FixedArray => "fixed-array",
            CorruptionPattern::Vla => "vla",
            CorruptionPattern::Alloca => "alloca",
            CorruptionPattern::StructUnion => "struct-union",
            CorruptionPattern::FormatString => "format-string",
            CorruptionPattern::LongjmpBypass => "longjmp-bypass",
        }
    }
}

impl fmt::Display for CorruptionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Stack-protector level a candidate is built with.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ProtectionLevel {
    None,
    Strong,
    All,
    Sanitizer,
}

impl ProtectionLevel {
    pub fn label(&self) -> &'static str {
        match self {
            ProtectionLevel::None => "none",
            ProtectionLevel::Strong => "strong",
            ProtectionLevel::All => "all",
            ProtectionLevel::Sanitizer => "sanitizer",
        }
    }

    /// Compiler flags selecting this protection level, unless overridden per
    /// compiler entry in the configuration.
    pub fn default_flags(&self) -> Vec<String> {
        let flags: &[&str] = match self {
            ProtectionLevel::None => &["-fno-stack-protector"],
            ProtectionLevel::Strong => &["-fstack-protector-strong"],
            ProtectionLevel::All => &["-fstack-protector-all"],
            ProtectionLevel::Sanitizer => &["-fsanitize=address"],
        };
        flags.iter().map(|s| s.to_string()).collect()
    }
}

impl fmt::Display for ProtectionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One registered seed program. Immutable once registered.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SeedVariant {
    pub id: String,
    pub arch: Arch,
    pub pattern: CorruptionPattern,
    /// Path to the seed's source template on disk.
    pub source: PathBuf,
}

/// Compiler identity plus its invocation template.
///
/// The template is an argv vector; `{input}` and `{output}` are substituted
/// within an element, and a literal `{flags}` element is spliced with the
/// protection flag set. No shell is involved.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct CompilerSpec {
    pub name: String,
    pub argv: Vec<String>,
}

/// One cell of the protection matrix: how a seed gets compiled.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub compiler: CompilerSpec,
    pub protection: ProtectionLevel,
    pub arch: Arch,
    /// Resolved protection flag set for this cell.
    pub flags: Vec<String>,
}

/// Concrete argument values for one candidate execution.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeParams {
    /// Runtime allocation size, present only for dynamically-sized patterns.
    pub alloc_size: Option<u32>,
    pub fill_size: u32,
}

impl ProbeParams {
    pub fn for_pattern(pattern: CorruptionPattern, default_alloc: u32, fill_size: u32) -> Self {
        let alloc_size = pattern.takes_alloc_size().then_some(default_alloc);
        ProbeParams {
            alloc_size,
            fill_size,
        }
    }

    /// Argument vector per the candidate CLI contract:
    /// `<fill_size>` or `<buf_size> <fill_size>`.
    pub fn argv(&self) -> Vec<String> {
        match self.alloc_size {
            Some(alloc) => vec![alloc.to_string(), self.fill_size.to_string()],
            None => vec![self.fill_size.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_decides_argument_shape() {
        let fixed = ProbeParams::for_pattern(CorruptionPattern::FixedArray, 64, 100);
        assert_eq!(fixed.argv(), vec!["100".to_string()]);

        let vla = ProbeParams::for_pattern(CorruptionPattern::Vla, 64, 100);
        assert_eq!(vla.argv(), vec!["64".to_string(), "100".to_string()]);

        let alloca = ProbeParams::for_pattern(CorruptionPattern::Alloca, 32, 7);
        assert_eq!(alloca.argv(), vec!["32".to_string(), "7".to_string()]);
    }

    #[test]
    fn dynamic_alloc_patterns_are_flagged() {
        assert!(CorruptionPattern::Vla.is_dynamic_alloc());
        assert!(CorruptionPattern::Alloca.is_dynamic_alloc());
        assert!(!CorruptionPattern::FixedArray.is_dynamic_alloc());
        assert!(!CorruptionPattern::FormatString.is_dynamic_alloc());
    }

    #[test]
    fn protection_levels_map_to_expected_flags() {
        assert_eq!(
            ProtectionLevel::None.default_flags(),
            vec!["-fno-stack-protector"]
        );
        assert_eq!(
            ProtectionLevel::All.default_flags(),
            vec!["-fstack-protector-all"]
        );
    }

    #[test]
    fn serde_round_trips_kebab_case_tags() {
        let json = serde_json::to_string(&CorruptionPattern::LongjmpBypass).unwrap();
        assert_eq!(json, "\"longjmp-bypass\"");
        let arch: Arch = serde_json::from_str("\"x86-64\"").unwrap();
        assert_eq!(arch, Arch::X86_64);
    }
}
