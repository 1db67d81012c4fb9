//! Toolchain registry: the fixed table of supported languages
//!
//! Each language maps to a [`LanguageSpec`] describing the fixed source
//! filename, an optional compile command and the run command. The table is
//! built once (builtin defaults plus configuration overrides) and is
//! read-only afterwards.

use crate::config::ToolchainOverride;
use crate::error::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Supported languages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Cpp,
    C,
    Java,
    JavaScript,
    Shell,
}

impl Language {
    pub const ALL: [Language; 6] = [
        Language::Python,
        Language::Cpp,
        Language::C,
        Language::Java,
        Language::JavaScript,
        Language::Shell,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Cpp => "cpp",
            Language::C => "c",
            Language::Java => "java",
            Language::JavaScript => "javascript",
            Language::Shell => "shell",
        }
    }

    /// Alternate identifiers accepted on lookup
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            Language::Python => &["py", "python3"],
            Language::Cpp => &["c++", "cxx", "cc"],
            Language::C => &["gcc"],
            Language::Java => &[],
            Language::JavaScript => &["js", "node", "nodejs"],
            Language::Shell => &["sh", "bash"],
        }
    }

    /// Runtime name used by Piston-compatible remote backends
    pub fn remote_name(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Cpp => "c++",
            Language::C => "c",
            Language::Java => "java",
            Language::JavaScript => "javascript",
            Language::Shell => "bash",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        let id = s.trim().to_ascii_lowercase();
        Language::ALL
            .into_iter()
            .find(|language| language.as_str() == id || language.aliases().contains(&id.as_str()))
            .ok_or_else(|| SandboxError::UnsupportedLanguage(s.trim().to_string()))
    }
}

/// Values substituted into command templates
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext {
    pub memory_mb: u64,
}

/// An argv with `{memory_mb}` placeholders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTemplate(Vec<String>);

impl CommandTemplate {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(argv.into_iter().map(Into::into).collect())
    }

    pub fn program(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn render(&self, ctx: &TemplateContext) -> Vec<String> {
        let memory = ctx.memory_mb.to_string();
        self.0
            .iter()
            .map(|arg| arg.replace("{memory_mb}", &memory))
            .collect()
    }
}

/// How to build and run one language
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageSpec {
    pub language: Language,
    /// Fixed name of the source file inside the workspace
    pub source_file: String,
    pub compile: Option<CommandTemplate>,
    pub run: CommandTemplate,
    /// Whether an address-space rlimit is safe for this runtime. JVM and V8
    /// reserve huge virtual ranges up front and get their ceiling through
    /// `{memory_mb}` in the run template instead.
    pub enforce_address_space: bool,
}

impl LanguageSpec {
    pub fn builtin(language: Language) -> Self {
        let (source_file, compile, run, enforce_address_space) = match language {
            Language::Python => (
                "main.py",
                None,
                CommandTemplate::new(["python3", "-B", "main.py"]),
                true,
            ),
            Language::Cpp => (
                "main.cpp",
                Some(CommandTemplate::new([
                    "g++",
                    "main.cpp",
                    "-O2",
                    "-std=gnu++17",
                    "-o",
                    "main_exec",
                ])),
                CommandTemplate::new(["./main_exec"]),
                true,
            ),
            Language::C => (
                "main.c",
                Some(CommandTemplate::new([
                    "gcc",
                    "main.c",
                    "-O2",
                    "-std=gnu11",
                    "-o",
                    "main_exec",
                    "-lm",
                ])),
                CommandTemplate::new(["./main_exec"]),
                true,
            ),
            Language::Java => (
                "Main.java",
                Some(CommandTemplate::new([
                    "javac",
                    "-encoding",
                    "UTF-8",
                    "-J-Xmx{memory_mb}m",
                    "Main.java",
                ])),
                CommandTemplate::new([
                    "java",
                    "-Xmx{memory_mb}m",
                    "-XX:+UseSerialGC",
                    "-Dfile.encoding=UTF-8",
                    "-cp",
                    ".",
                    "Main",
                ]),
                false,
            ),
            Language::JavaScript => (
                "main.js",
                None,
                CommandTemplate::new(["node", "--max-old-space-size={memory_mb}", "main.js"]),
                false,
            ),
            Language::Shell => ("main.sh", None, CommandTemplate::new(["sh", "main.sh"]), true),
        };

        Self {
            language,
            source_file: source_file.to_string(),
            compile,
            run,
            enforce_address_space,
        }
    }

    fn apply(&mut self, overrides: &ToolchainOverride) {
        if let Some(compile) = &overrides.compile {
            self.compile = if compile.is_empty() {
                None
            } else {
                Some(CommandTemplate::new(compile.iter().cloned()))
            };
        }
        if let Some(run) = &overrides.run {
            self.run = CommandTemplate::new(run.iter().cloned());
        }
        if let Some(enforce) = overrides.enforce_address_space {
            self.enforce_address_space = enforce;
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }
}

/// Immutable language table
#[derive(Debug, Clone)]
pub struct ToolchainRegistry {
    specs: HashMap<Language, Arc<LanguageSpec>>,
}

impl ToolchainRegistry {
    pub fn builtin() -> Self {
        let specs = Language::ALL
            .into_iter()
            .map(|language| (language, Arc::new(LanguageSpec::builtin(language))))
            .collect();
        Self { specs }
    }

    /// Builtin table with per-language command overrides applied.
    /// Override keys accept the same ids and aliases as [`Self::resolve`].
    pub fn with_overrides(overrides: &HashMap<String, ToolchainOverride>) -> Result<Self> {
        let mut specs: HashMap<Language, LanguageSpec> = Language::ALL
            .into_iter()
            .map(|language| (language, LanguageSpec::builtin(language)))
            .collect();

        for (id, ovr) in overrides {
            let language = id.parse::<Language>().map_err(|_| {
                SandboxError::Config(format!("toolchain override for unknown language: {}", id))
            })?;
            if let Some(spec) = specs.get_mut(&language) {
                spec.apply(ovr);
            }
        }

        if let Some(spec) = specs.values().find(|spec| spec.run.is_empty()) {
            return Err(SandboxError::Config(format!(
                "run command for {} must not be empty",
                spec.language
            )));
        }

        Ok(Self {
            specs: specs
                .into_iter()
                .map(|(language, spec)| (language, Arc::new(spec)))
                .collect(),
        })
    }

    /// Look up a language by id or alias
    pub fn resolve(&self, id: &str) -> Result<Arc<LanguageSpec>> {
        let language = id.parse::<Language>()?;
        Ok(self.get(language))
    }

    pub fn get(&self, language: Language) -> Arc<LanguageSpec> {
        match self.specs.get(&language) {
            Some(spec) => Arc::clone(spec),
            None => Arc::new(LanguageSpec::builtin(language)),
        }
    }

    /// All specs in declaration order
    pub fn languages(&self) -> Vec<Arc<LanguageSpec>> {
        Language::ALL.into_iter().map(|language| self.get(language)).collect()
    }
}

impl Default for ToolchainRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
