use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Directory artifacts are downloaded into unless `--output` is given.
pub const DEFAULT_OUTPUT_DIR: &str = "outputs";

/// Example character created by `init --create-example`.
pub const DEFAULT_EXAMPLE_NAME: &str = "example_character";

#[derive(Parser, Debug)]
#[command(name = "dhgen")]
#[command(version)]
#[command(about = "Digital-human video generation on a ComfyUI backend")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory holding one folder per character
    #[arg(long, global = true, default_value = "characters")]
    pub characters_dir: PathBuf,

    /// Debug-level logging (overridden by RUST_LOG)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List valid characters
    List,

    /// Show the detailed validation report of a character
    Info { name: String },

    /// Validate a character folder (exit code 1 when invalid)
    Validate { name: String },

    /// Create the characters directory
    Init {
        /// Also scaffold an example character folder
        #[arg(long)]
        create_example: bool,

        #[arg(long, default_value = DEFAULT_EXAMPLE_NAME)]
        example_name: String,
    },

    /// Upload, submit, wait with live progress, then download the results
    Generate {
        #[command(flatten)]
        job: JobArgs,

        /// Completion timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        #[arg(long, short = 'o', default_value = DEFAULT_OUTPUT_DIR)]
        output: PathBuf,
    },

    /// Upload and submit only; prints the job id
    Submit {
        #[command(flatten)]
        job: JobArgs,
    },

    /// Re-attach to a submitted job and wait for it
    Monitor {
        job_id: String,

        /// Completion timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Only list artifact URIs
        #[arg(long)]
        no_download: bool,

        #[arg(long, short = 'o', default_value = DEFAULT_OUTPUT_DIR)]
        output: PathBuf,
    },

    /// Download the artifacts of a finished job
    Result {
        job_id: String,

        #[arg(long, short = 'o', default_value = DEFAULT_OUTPUT_DIR)]
        output: PathBuf,
    },

    /// Report whether a job is finished, running, pending or unknown
    Status { job_id: String },

    /// Show character cache statistics
    Cache {
        /// Clear the cache after scanning
        #[arg(long)]
        clear: bool,
    },
}

/// What to generate: shared by `generate` and `submit`.
#[derive(Args, Debug, Clone)]
pub struct JobArgs {
    /// Character folder name
    pub name: String,

    /// Text to speak; `-` reads it from stdin
    pub text: String,

    /// Positive prompt (defaults to the character's config)
    #[arg(long)]
    pub positive: Option<String>,

    /// Negative prompt (defaults to the character's config)
    #[arg(long)]
    pub negative: Option<String>,

    /// API-format workflow JSON (env DHGEN_WORKFLOW)
    #[arg(long)]
    pub workflow: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["dhgen", "list", "--characters-dir", "/tmp/chars", "-v"]).unwrap();
        assert_eq!(cli.characters_dir, PathBuf::from("/tmp/chars"));
        assert!(cli.verbose);
        assert_matches!(cli.command, Command::List);
    }

    #[test]
    fn generate_defaults() {
        let cli = Cli::try_parse_from(["dhgen", "generate", "alice", "Hello there"]).unwrap();
        assert_eq!(cli.characters_dir, PathBuf::from("characters"));
        assert_matches!(
            cli.command,
            Command::Generate { job, timeout: None, output }
                if job.name == "alice"
                    && job.text == "Hello there"
                    && job.positive.is_none()
                    && output == PathBuf::from(DEFAULT_OUTPUT_DIR)
        );
    }

    #[test]
    fn monitor_flags() {
        let cli = Cli::try_parse_from(["dhgen", "monitor", "p-1", "--timeout", "30", "--no-download"]).unwrap();
        assert_matches!(
            cli.command,
            Command::Monitor { job_id, timeout: Some(30), no_download: true, .. } if job_id == "p-1"
        );
    }

    #[test]
    fn init_example_name_default() {
        let cli = Cli::try_parse_from(["dhgen", "init", "--create-example"]).unwrap();
        assert_matches!(
            cli.command,
            Command::Init { create_example: true, example_name } if example_name == DEFAULT_EXAMPLE_NAME
        );
    }

    #[test]
    fn missing_text_is_rejected() {
        assert!(Cli::try_parse_from(["dhgen", "submit", "alice"]).is_err());
    }
}
