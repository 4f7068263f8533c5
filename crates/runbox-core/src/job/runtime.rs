//! Closed table of supported runtimes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Nodejs,
    Python,
    Java,
    Cpp,
    Go,
    Rust,
}

/// Everything the supervisor needs to know about a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeProfile {
    pub image: &'static str,
    /// File the raw source is written to. `None` for git-only runtimes.
    pub file_name: Option<&'static str>,
    pub default_command: &'static str,
    /// Package manager used to install raw-code dependencies.
    pub installer: Option<&'static str>,
}

impl Runtime {
    pub const ALL: [Runtime; 6] = [
        Runtime::Nodejs,
        Runtime::Python,
        Runtime::Java,
        Runtime::Cpp,
        Runtime::Go,
        Runtime::Rust,
    ];

    pub fn profile(self) -> RuntimeProfile {
        match self {
            Runtime::Nodejs => RuntimeProfile {
                image: "node:18",
                file_name: Some("code.js"),
                default_command: "node code.js",
                installer: Some("npm install"),
            },
            Runtime::Python => RuntimeProfile {
                image: "python:3.10",
                file_name: Some("code.py"),
                default_command: "python code.py",
                installer: Some("pip install"),
            },
            Runtime::Java => RuntimeProfile {
                image: "openjdk:17",
                file_name: Some("Main.java"),
                default_command: "javac Main.java && java Main",
                installer: None,
            },
            Runtime::Cpp => RuntimeProfile {
                image: "gcc:latest",
                file_name: Some("code.cpp"),
                default_command: "g++ -o program code.cpp && ./program",
                installer: None,
            },
            Runtime::Go => RuntimeProfile {
                image: "golang:1.20",
                file_name: None,
                default_command: "go run .",
                installer: None,
            },
            Runtime::Rust => RuntimeProfile {
                image: "rust:1.71",
                file_name: None,
                default_command: "cargo run --release",
                installer: None,
            },
        }
    }

    pub fn supports_raw_code(self) -> bool {
        self.profile().file_name.is_some()
    }

    pub fn raw_code_runtimes() -> Vec<Runtime> {
        Self::ALL
            .into_iter()
            .filter(|r| r.supports_raw_code())
            .collect()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Runtime::Nodejs => "nodejs",
            Runtime::Python => "python",
            Runtime::Java => "java",
            Runtime::Cpp => "cpp",
            Runtime::Go => "go",
            Runtime::Rust => "rust",
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::Nodejs
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Runtime {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "nodejs" | "node" => Ok(Runtime::Nodejs),
            "python" | "python3" => Ok(Runtime::Python),
            "java" => Ok(Runtime::Java),
            "cpp" | "c++" | "c" => Ok(Runtime::Cpp),
            "go" | "golang" => Ok(Runtime::Go),
            "rust" => Ok(Runtime::Rust),
            other => Err(ValidationError::UnknownRuntime(other.to_string())),
        }
    }
}
