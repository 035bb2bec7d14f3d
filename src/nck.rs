//! Unlock credential (NCK) derivation.
//!
//! The derivation itself is a keyed transform of the IMEI that this crate does
//! not implement. It is reached through [`CodeGenerator`], either by plugging an
//! implementation in directly or by running an external program.

use std::path::PathBuf;
use std::process::Command;

use tracing::debug;

use crate::device::Imei;
use crate::error::{Error, Result};

/// Salt the E620 datacard family derives its unlock codes with.
pub const DEFAULT_SALT: &str = "hwe620datacard";

/// Derives the unlock credential for a device.
pub trait CodeGenerator {
    fn generate(&self, imei: &Imei, salt: &str) -> Result<String>;
}

/// Runs `<program> <imei> <salt>` and takes the first line of its stdout as the code.
#[derive(Debug, Clone, Default)]
pub struct ExternalGenerator {
    program: Option<PathBuf>,
}

impl ExternalGenerator {
    pub fn new(program: Option<PathBuf>) -> Self {
        Self { program }
    }
}

impl CodeGenerator for ExternalGenerator {
    fn generate(&self, imei: &Imei, salt: &str) -> Result<String> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| Error::Generator(String::from("no generator program configured")))?;

        debug!(program = %program.display(), %imei, "Deriving unlock code");
        let output = Command::new(program)
            .arg(imei.as_str())
            .arg(salt)
            .output()
            .map_err(|e| Error::Generator(format!("failed to run '{}': {}", program.display(), e)))?;

        if !output.status.success() {
            return Err(Error::Generator(format!(
                "'{}' exited with {}",
                program.display(),
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let code = stdout.lines().next().unwrap_or("").trim();
        // The code ends up inside a quoted AT argument.
        if code.is_empty() || code.contains('"') {
            return Err(Error::Generator(format!(
                "'{}' produced no usable code",
                program.display()
            )));
        }
        Ok(code.to_owned())
    }
}
