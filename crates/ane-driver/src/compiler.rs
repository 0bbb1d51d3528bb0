// SPDX-License-Identifier: AGPL-3.0-only

//! External compiler invocation
//!
//! The vendor compiler is a black box: it reads a network description and
//! writes an HWX file. Only its flag surface and exit status are modelled;
//! the produced file goes through the container codec before it is trusted.

use crate::error::{AneError, Result};
use ane_hwx::HwxContainer;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Compiler flag surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerOptions {
    /// Target architecture.
    pub target: String,
    /// Debug mask, passed through verbatim.
    pub debug_mask: u32,
    /// Extra options appended after the standard flags.
    pub extra: Vec<String>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            target: "h13".to_string(),
            debug_mask: 0,
            extra: Vec::new(),
        }
    }
}

impl CompilerOptions {
    /// Command line for compiling `input` into `output`.
    pub fn to_args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--target".into(),
            self.target.clone().into(),
            "--debug-mask".into(),
            format!("{:#x}", self.debug_mask).into(),
            "-i".into(),
            input.into(),
            "-o".into(),
            output.into(),
        ];
        args.extend(self.extra.iter().map(OsString::from));
        args
    }
}

/// A compiler binary plus its options.
#[derive(Debug, Clone)]
pub struct ExternalCompiler {
    program: PathBuf,
    options: CompilerOptions,
}

impl ExternalCompiler {
    /// Compiler at `program` with default options.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            options: CompilerOptions::default(),
        }
    }

    /// Builder: replace the options.
    #[must_use]
    pub fn with_options(mut self, options: CompilerOptions) -> Self {
        self.options = options;
        self
    }

    /// Options in use.
    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    /// Run the compiler and parse what it produced.
    ///
    /// # Errors
    ///
    /// - `CompilerFailed` if the binary cannot be started or exits non-zero
    /// - `InvalidContainer` if the output is not a valid HWX program
    pub fn compile(&self, input: &Path, output: &Path) -> Result<HwxContainer> {
        let args = self.options.to_args(input, output);
        debug!("Running {} {:?}", self.program.display(), args);

        let result = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|e| AneError::compiler_failed(&self.program, format!("cannot start: {e}")))?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(AneError::compiler_failed(
                &self.program,
                format!("{}: {}", result.status, stderr.trim()),
            ));
        }

        let program = HwxContainer::from_file(output)?;
        program.validate()?;
        info!(
            "✅ Compiled {} → {} ({} records)",
            input.display(),
            output.display(),
            program.len()
        );
        Ok(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_surface() {
        let opts = CompilerOptions {
            target: "h14".to_string(),
            debug_mask: 0x20,
            extra: vec!["--no-fuse".to_string()],
        };
        let args = opts.to_args(Path::new("net.json"), Path::new("net.hwx"));
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            ["--target", "h14", "--debug-mask", "0x20", "-i", "net.json", "-o", "net.hwx", "--no-fuse"]
        );
    }

    #[test]
    fn missing_binary_is_a_compiler_failure() {
        let c = ExternalCompiler::new("/nonexistent/ane-compiler");
        let err = c
            .compile(Path::new("in.json"), Path::new("out.hwx"))
            .unwrap_err();
        assert_eq!(err.exit_code(), 7);
    }
}
