//! Command-line surface of `redactd`.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{Configuration, InputSource, OutputSink, PipelineSettings};
use crate::error::{PipelineError, EXIT_OK, EXIT_USAGE};

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(
    name = "redactd",
    version,
    about = "Redact faces and license plates from a video stream"
)]
pub struct Cli {
    /// Detector (primary inference) configuration file. Required.
    #[arg(short = 'c', long = "pgie_config", value_name = "PATH")]
    pub pgie_config: Option<PathBuf>,

    /// Recorded input file. Without it, frames come from the capture device.
    #[arg(short = 'i', long = "input_mp4", value_name = "PATH")]
    pub input_mp4: Option<PathBuf>,

    /// Encode the redacted stream to this file instead of displaying it.
    #[arg(short = 'o', long = "output_mp4", value_name = "PATH")]
    pub output_mp4: Option<PathBuf>,

    /// Existing directory for per-frame KITTI annotations.
    #[arg(short = 'k', long = "output_kitti", value_name = "DIR")]
    pub output_kitti: Option<PathBuf>,

    /// Redaction policy (TOML). Overrides the configured policy.
    #[arg(long, value_name = "PATH")]
    pub policy: Option<PathBuf>,
}

/// Exit code for a parse outcome: help and version exit cleanly, anything else is usage.
pub fn parse_exit_code(err: &clap::Error) -> i32 {
    if err.use_stderr() {
        EXIT_USAGE
    } else {
        EXIT_OK
    }
}

impl Cli {
    /// Fold command-line overrides into `settings`.
    pub fn apply_overrides(&self, settings: &mut PipelineSettings) {
        if let Some(policy) = &self.policy {
            settings.policy_path = Some(policy.clone());
        }
    }

    pub fn into_configuration(
        self,
        settings: &PipelineSettings,
    ) -> Result<Configuration, PipelineError> {
        let detector_config = self
            .pgie_config
            .ok_or_else(|| PipelineError::configuration("missing required --pgie_config"))?;

        let input = match self.input_mp4 {
            Some(path) => InputSource::File(path),
            None => InputSource::Capture(settings.capture_device.clone()),
        };
        let output = match self.output_mp4 {
            Some(path) => OutputSink::File(path),
            None => OutputSink::Display,
        };
        let annotation_dir = match self.output_kitti {
            Some(dir) if dir.is_dir() => Some(dir),
            Some(dir) => {
                log::warn!(
                    "{} is not a directory; annotation export disabled",
                    dir.display()
                );
                None
            }
            None => None,
        };

        Ok(Configuration {
            input,
            output,
            detector_config,
            annotation_dir,
        })
    }
}
