//! HEIC → JPEG conversion through external commands.
//!
//! The `image` crate has no HEIF decoder, so HEIC sources are handed to a
//! command-line converter and the resulting JPEG is decoded normally. A
//! secondary command is tried when the primary one fails.

use super::codec::ImagingError;
use crate::config::HeicConfig;
use std::path::Path;
use std::process::Command;

/// Converts HEIC bytes into bytes the codec can decode.
pub trait HeicConverter: Send + Sync {
    fn convert(&self, heic: &[u8]) -> Result<Vec<u8>, ImagingError>;
}

/// Runs `primary`, then `secondary`, as `argv` templates with `{input}` and
/// `{output}` placeholders.
#[derive(Debug, Clone)]
pub struct CommandHeicConverter {
    primary: Vec<String>,
    secondary: Vec<String>,
}

impl CommandHeicConverter {
    pub fn new(primary: Vec<String>, secondary: Vec<String>) -> Self {
        Self { primary, secondary }
    }

    pub fn from_config(config: &HeicConfig) -> Self {
        Self::new(config.primary.clone(), config.secondary.clone())
    }

    fn run(argv: &[String], input: &Path, output: &Path) -> Result<(), ImagingError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ImagingError::Conversion("no converter command configured".into()))?;
        let args = args.iter().map(|a| {
            a.replace("{input}", &input.to_string_lossy())
                .replace("{output}", &output.to_string_lossy())
        });
        let status = Command::new(program)
            .args(args)
            .status()
            .map_err(|e| ImagingError::Conversion(format!("{program}: {e}")))?;
        if !status.success() {
            return Err(ImagingError::Conversion(format!("{program} exited with {status}")));
        }
        Ok(())
    }
}

impl HeicConverter for CommandHeicConverter {
    fn convert(&self, heic: &[u8]) -> Result<Vec<u8>, ImagingError> {
        let dir = tempfile::TempDir::new()?;
        let input = dir.path().join("source.heic");
        let output = dir.path().join("converted.jpg");
        std::fs::write(&input, heic)?;

        let first = Self::run(&self.primary, &input, &output);
        if let Err(err) = first {
            tracing::warn!(%err, "primary HEIC converter failed, trying secondary");
            Self::run(&self.secondary, &input, &output)?;
        }
        Ok(std::fs::read(&output)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_commands_fail() {
        let converter = CommandHeicConverter::new(vec![], vec![]);
        assert!(matches!(
            converter.convert(b"x"),
            Err(ImagingError::Conversion(_))
        ));
    }

    #[test]
    fn missing_program_falls_through_to_error() {
        let converter = CommandHeicConverter::new(
            vec!["pictor-test-no-such-binary".into()],
            vec!["pictor-test-no-such-binary-either".into()],
        );
        assert!(converter.convert(b"x").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn secondary_runs_when_primary_fails() {
        let converter = CommandHeicConverter::new(
            vec!["false".into()],
            vec!["cp".into(), "{input}".into(), "{output}".into()],
        );
        assert_eq!(converter.convert(b"bytes").unwrap(), b"bytes");
    }
}
