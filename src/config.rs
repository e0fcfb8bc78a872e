// Tue Jan 13 2026 - Alex

use std::path::PathBuf;

use crate::error::{FrontendError, Result};

/// Maximum number of match/action rules per run.
pub const MAX_ACTIONS: usize = 1 << 10;

pub const PAGE_SIZE: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Binary,
    Json,
    Patch,
    PatchGz,
    PatchBz2,
    PatchXz,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "binary" => Ok(OutputFormat::Binary),
            "json" => Ok(OutputFormat::Json),
            "patch" => Ok(OutputFormat::Patch),
            "patch.gz" => Ok(OutputFormat::PatchGz),
            "patch.bz2" => Ok(OutputFormat::PatchBz2),
            "patch.xz" => Ok(OutputFormat::PatchXz),
            _ => Err(FrontendError::Semantic(format!(
                "bad value \"{}\" for `--format' option; expected one of \
                 \"binary\", \"json\", \"patch\", \"patch.gz\", \"patch.bz2\", \
                 or \"patch.xz\"",
                s
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Binary => "binary",
            OutputFormat::Json => "json",
            OutputFormat::Patch => "patch",
            OutputFormat::PatchGz => "patch.gz",
            OutputFormat::PatchBz2 => "patch.bz2",
            OutputFormat::PatchXz => "patch.xz",
        }
    }

    /// Filename suffix auto-appended when missing, if any.
    pub fn suffix(&self) -> Option<&'static str> {
        match self {
            OutputFormat::Patch => Some(".patch"),
            OutputFormat::PatchGz => Some(".patch.gz"),
            OutputFormat::PatchBz2 => Some(".patch.bz2"),
            OutputFormat::PatchXz => Some(".patch.xz"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    Att,
    Intel,
}

impl Syntax {
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "ATT" => Ok(Syntax::Att),
            "intel" => Ok(Syntax::Intel),
            _ => Err(FrontendError::Semantic(format!(
                "bad value \"{}\" for `--syntax' option; expected \"ATT\" or \
                 \"intel\"",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptLevel {
    O0,
    O1,
    O2,
    O3,
    Os,
}

impl OptLevel {
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "0" => Ok(OptLevel::O0),
            "1" => Ok(OptLevel::O1),
            "2" => Ok(OptLevel::O2),
            "3" => Ok(OptLevel::O3),
            "s" => Ok(OptLevel::Os),
            _ => Err(FrontendError::Semantic(format!(
                "bad value \"-O{}\" for `-O' option; expected one of \
                 -O0,-O1,-O2,-O3,-Os",
                s
            ))),
        }
    }

    /// The fixed table of backend options per optimization level.
    pub fn backend_options(&self) -> Vec<String> {
        let opts: &[&str] = match self {
            OptLevel::O0 => &[
                "-Ojump-elim=0",
                "-Ojump-elim-size=0",
                "-Ojump-peephole=false",
                "-Oorder-trampolines=false",
                "-Oscratch-stack=false",
                "--mem-granularity=64",
            ],
            OptLevel::O1 => &[
                "-Ojump-elim=0",
                "-Ojump-elim-size=0",
                "-Oorder-trampolines=false",
                "-Ojump-peephole=true",
                "-Oscratch-stack=true",
                "--mem-granularity=128",
            ],
            OptLevel::O2 => &[
                "-Ojump-elim=32",
                "-Ojump-elim-size=64",
                "-Oorder-trampolines=true",
                "-Ojump-peephole=true",
                "-Oscratch-stack=true",
                "--mem-granularity=128",
            ],
            OptLevel::O3 => &[
                "-Ojump-elim=64",
                "-Ojump-elim-size=512",
                "-Oorder-trampolines=true",
                "-Ojump-peephole=true",
                "-Oscratch-stack=true",
                "--mem-granularity=4096",
            ],
            OptLevel::Os => &[
                "-Ojump-elim=0",
                "-Ojump-elim-size=0",
                "-Ojump-peephole=true",
                "-Oorder-trampolines=true",
                "-Oscratch-stack=true",
                "--mem-granularity=4096",
            ],
        };
        opts.iter().map(|s| s.to_string()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryMode {
    Exe,
    Dso,
}

impl BinaryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryMode::Exe => "exe",
            BinaryMode::Dso => "dso",
        }
    }
}

/// Mapping-size table indexed by compression level 0..9.
const MAPPING_SIZE: [&str; 10] = [
    "2097152", "1048576", "524288", "262144", "131072", "65536", "32768",
    "16384", "8192", "4096",
];

/// Validated run configuration, threaded through the pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    pub input: PathBuf,
    pub output: String,
    pub backend: PathBuf,
    pub format: OutputFormat,
    pub syntax: Syntax,
    pub opt_level: OptLevel,
    pub compression: u8,
    pub sync: Option<usize>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub executable: bool,
    pub shared: bool,
    pub static_loader: bool,
    pub trap_all: bool,
    pub traps: Vec<u64>,
    pub backend_options: Vec<String>,
    pub debug: bool,
    pub no_warnings: bool,
}

impl Config {
    /// Collect the option arguments sent to the backend before any
    /// trampoline or instruction message.
    pub fn collected_backend_options(&self) -> Vec<String> {
        let mut options = Vec::new();
        if self.compression != 9 {
            options.push("--mem-mapping-size".to_string());
            options.push(MAPPING_SIZE[self.compression as usize].to_string());
        }
        if self.static_loader {
            options.push("--static-loader".to_string());
        }
        if self.trap_all {
            options.push("--trap-all".to_string());
        }
        options.extend(self.opt_level.backend_options());
        options.extend(self.backend_options.iter().cloned());
        options
    }

    /// Output filename with the format suffix appended when missing.
    /// `--format json` redirects the message stream itself, so the name
    /// embedded in the emit message reverts to the default binary output.
    pub fn emit_target(&self) -> (String, OutputFormat) {
        if self.format == OutputFormat::Json {
            return ("a.out".to_string(), OutputFormat::Binary);
        }
        let mut output = self.output.clone();
        if let Some(suffix) = self.format.suffix() {
            if !output.ends_with(suffix) {
                output.push_str(suffix);
            }
        }
        (output, self.format)
    }
}
