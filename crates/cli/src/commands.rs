//! Command handlers.
//!
//! Character commands run offline and write to the given writer. Job
//! commands talk to ComfyUI through one [`MonitorSession`] per invocation.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context};
use dhgen_comfyui::config::MonitorConfig;
use dhgen_comfyui::error::MonitorError;
use dhgen_comfyui::session::{MonitorSession, WaitOptions};
use dhgen_comfyui::workflow::{
    DigitalHumanBindings, DigitalHumanRequest, JobDescriptor, WorkflowTemplate, DEFAULT_WORKFLOW_FILE,
};
use dhgen_core::character::{Character, CharacterLibrary};
use dhgen_core::types::JobId;
use tokio_util::sync::CancellationToken;

use crate::args::{Cli, Command, JobArgs};
use crate::render;

/// Environment variable naming the workflow template.
pub const WORKFLOW_ENV: &str = "DHGEN_WORKFLOW";

pub async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let library = CharacterLibrary::new(&cli.characters_dir);
    let mut out = std::io::stdout();

    match cli.command {
        Command::List => list(&library, &mut out)?,
        Command::Info { name } => info(&library, &name, &mut out)?,
        Command::Validate { name } => return validate(&library, &name, &mut out),
        Command::Init {
            create_example,
            example_name,
        } => init(&library, create_example.then_some(example_name.as_str()), &mut out)?,
        Command::Cache { clear } => cache(&library, clear, &mut out)?,
        Command::Generate { job, timeout, output } => {
            let session = open_session()?;
            let result = generate(&session, &library, &job, timeout.map(Duration::from_secs), &output).await;
            session.shutdown().await;
            result?;
        }
        Command::Submit { job } => {
            let session = open_session()?;
            let result = submit(&session, &library, &job).await;
            session.shutdown().await;
            result?;
        }
        Command::Monitor {
            job_id,
            timeout,
            no_download,
            output,
        } => {
            let session = open_session()?;
            let dest = (!no_download).then_some(output);
            let result = monitor(&session, &JobId::new(job_id), timeout.map(Duration::from_secs), dest).await;
            session.shutdown().await;
            result?;
        }
        Command::Result { job_id, output } => {
            let session = open_session()?;
            // A failure recorded in history is reported, not listed as empty.
            let artifacts = session
                .fetch(&JobId::new(job_id), Some(output.as_path()))
                .await
                .map_err(explain)?;
            println!("{}", render::format_artifacts(&artifacts));
        }
        Command::Status { job_id } => {
            let session = open_session()?;
            let job_id = JobId::new(job_id);
            let location = session.locate(&job_id).await.context("Failed to query job status")?;
            println!("{}", render::format_location(&job_id, &location));
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// Character commands
// ---------------------------------------------------------------------------

pub fn list(library: &CharacterLibrary, out: &mut impl Write) -> anyhow::Result<()> {
    let characters = library.scan();
    writeln!(out, "{}", render::format_character_list(&characters))?;
    if characters.is_empty() {
        writeln!(
            out,
            "Create a folder under '{}' with one audio file and one image or video",
            library.root().display()
        )?;
    }
    Ok(())
}

pub fn info(library: &CharacterLibrary, name: &str, out: &mut impl Write) -> anyhow::Result<()> {
    let report = library.validate(name)?;
    writeln!(out, "{}", report.detailed_summary())?;
    if report.is_valid() {
        let character = library.load(name)?;
        writeln!(out, "Audio:  {}", character.audio_path.display())?;
        writeln!(
            out,
            "Visual: {} ({})",
            character.visual_path.display(),
            character.visual_kind.as_str()
        )?;
        if !character.config.description.is_empty() {
            writeln!(out, "Description: {}", character.config.description)?;
        }
        if !character.config.tags.is_empty() {
            writeln!(out, "Tags: {}", character.config.tags.join(", "))?;
        }
        writeln!(out, "Positive prompt: {}", character.config.positive_prompt)?;
    }
    Ok(())
}

/// Prints the report; exit code 1 when the character is invalid.
pub fn validate(library: &CharacterLibrary, name: &str, out: &mut impl Write) -> anyhow::Result<ExitCode> {
    let report = library.validate(name)?;
    writeln!(out, "{}", report.detailed_summary())?;
    Ok(if report.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

pub fn init(library: &CharacterLibrary, example: Option<&str>, out: &mut impl Write) -> anyhow::Result<()> {
    library.ensure_root()?;
    writeln!(out, "Characters directory: {}", library.root().display())?;
    if let Some(name) = example {
        let dir = library.create_example(name)?;
        writeln!(out, "Example character created at {}", dir.display())?;
        writeln!(out, "Add a reference audio file and an image or video to it")?;
    }
    Ok(())
}

pub fn cache(library: &CharacterLibrary, clear: bool, out: &mut impl Write) -> anyhow::Result<()> {
    library.scan();
    let stats = library.cache_stats();
    writeln!(
        out,
        "Cache: {} entries ({} active, {} expired)",
        stats.total, stats.active, stats.expired
    )?;
    if clear {
        library.clear_cache();
        writeln!(out, "Cache cleared")?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Job commands
// ---------------------------------------------------------------------------

fn open_session() -> anyhow::Result<MonitorSession> {
    let config = MonitorConfig::from_env().context("Invalid ComfyUI configuration")?;
    tracing::debug!(api_url = %config.api_url, ws_url = %config.ws_url, "Using ComfyUI server");
    Ok(MonitorSession::new(config)?)
}

/// `--workflow`, then the environment, then the default file name.
pub fn resolve_workflow_path<F>(flag: Option<&Path>, lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    flag.map(Path::to_path_buf)
        .or_else(|| lookup(WORKFLOW_ENV).filter(|v| !v.is_empty()).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKFLOW_FILE))
}

/// The spoken text; `-` reads all of `input`.
pub fn resolve_text(text: &str, input: &mut impl Read) -> anyhow::Result<String> {
    let text = if text == "-" {
        let mut buf = String::new();
        input.read_to_string(&mut buf).context("Failed to read text from stdin")?;
        buf
    } else {
        text.to_string()
    };
    let text = text.trim();
    if text.is_empty() {
        bail!("Text to speak is empty");
    }
    Ok(text.to_string())
}

/// Load the character, upload its references and fill the template.
async fn prepare(
    session: &MonitorSession,
    library: &CharacterLibrary,
    job: &JobArgs,
) -> anyhow::Result<(Character, JobDescriptor)> {
    let character = library
        .load(&job.name)
        .with_context(|| format!("Character '{}' is not usable", job.name))?;
    let text = resolve_text(&job.text, &mut std::io::stdin())?;

    let workflow_path = resolve_workflow_path(job.workflow.as_deref(), |key| std::env::var(key).ok());
    let template = WorkflowTemplate::load(&workflow_path)
        .with_context(|| format!("Failed to load workflow {}", workflow_path.display()))?;

    let audio_asset = session
        .upload_asset(&character.audio_path)
        .await
        .context("Failed to upload reference audio")?;
    let visual_asset = session
        .upload_asset(&character.visual_path)
        .await
        .context("Failed to upload reference visual")?;

    let descriptor = session.describe(
        &DigitalHumanBindings::default(),
        &template,
        &DigitalHumanRequest {
            audio_asset: &audio_asset,
            visual_asset: &visual_asset,
            text: &text,
            positive_prompt: job.positive.as_deref().unwrap_or(&character.config.positive_prompt),
            negative_prompt: job.negative.as_deref().unwrap_or(&character.config.negative_prompt),
            params: &character.config.workflow_params,
        },
    )?;
    Ok((character, descriptor))
}

async fn generate(
    session: &MonitorSession,
    library: &CharacterLibrary,
    job: &JobArgs,
    timeout: Option<Duration>,
    output: &Path,
) -> anyhow::Result<()> {
    let (character, descriptor) = prepare(session, library, job).await?;
    println!("Generating for character '{}'", character.name);

    let printer = spawn_event_printer(session);
    let options = WaitOptions {
        timeout,
        output_dir: Some(output.to_path_buf()),
        cancel: Some(ctrl_c_token()),
    };
    let result = session.run_and_wait(&descriptor, &options).await;
    printer.abort();

    let artifacts = result.map_err(explain)?;
    println!("{}", render::format_artifacts(&artifacts));
    Ok(())
}

async fn submit(session: &MonitorSession, library: &CharacterLibrary, job: &JobArgs) -> anyhow::Result<()> {
    let (character, descriptor) = prepare(session, library, job).await?;
    let job_id = session.submit(&descriptor).await.context("Submission failed")?;
    println!("Submitted job {job_id} for character '{}'", character.name);
    println!("  monitor: dhgen monitor {job_id}");
    println!("  results: dhgen result {job_id}");
    Ok(())
}

async fn monitor(
    session: &MonitorSession,
    job_id: &JobId,
    timeout: Option<Duration>,
    dest: Option<PathBuf>,
) -> anyhow::Result<()> {
    let printer = spawn_event_printer(session);
    let options = WaitOptions {
        timeout,
        output_dir: dest,
        cancel: Some(ctrl_c_token()),
    };
    let result = session.monitor(job_id, &options).await;
    printer.abort();

    let artifacts = result.map_err(explain)?;
    println!("{}", render::format_artifacts(&artifacts));
    Ok(())
}

/// Print session events to stderr until aborted.
fn spawn_event_printer(session: &MonitorSession) -> tokio::task::JoinHandle<()> {
    let mut events = session.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => eprintln!("{}", render::event_line(&event)),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Progress printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Cancelled on Ctrl-C. Detaches the waiter; the remote job keeps running.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    token
}

/// Attach a follow-up hint to errors that leave the job resumable.
fn explain(err: MonitorError) -> anyhow::Error {
    let hint = match &err {
        MonitorError::Timeout { job_id, .. }
        | MonitorError::ConnectionLost { job_id }
        | MonitorError::Cancelled { job_id } => Some(format!("resume with: dhgen monitor {job_id}")),
        MonitorError::ResultNotFound { job_id, .. } => Some(format!("retry with: dhgen result {job_id}")),
        _ => None,
    };
    match hint {
        Some(hint) => anyhow::Error::new(err).context(hint),
        None => err.into(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn workflow_flag_wins_over_env() {
        let env = |_: &str| Some("from-env.json".to_string());
        assert_eq!(
            resolve_workflow_path(Some(Path::new("flag.json")), env),
            PathBuf::from("flag.json")
        );
        assert_eq!(resolve_workflow_path(None, env), PathBuf::from("from-env.json"));
        assert_eq!(
            resolve_workflow_path(None, |_| None),
            PathBuf::from(DEFAULT_WORKFLOW_FILE)
        );
    }

    #[test]
    fn dash_reads_text_from_input() {
        let mut input = Cursor::new("  Hello from stdin\n");
        assert_eq!(resolve_text("-", &mut input).unwrap(), "Hello from stdin");
        assert_eq!(resolve_text("inline", &mut Cursor::new("")).unwrap(), "inline");
        assert!(resolve_text("-", &mut Cursor::new("   ")).is_err());
    }

    #[test]
    fn resumable_errors_carry_a_hint() {
        let err = explain(MonitorError::Timeout {
            job_id: JobId::new("p9"),
            timeout: Duration::from_secs(1),
        });
        assert!(format!("{err:#}").contains("dhgen monitor p9"));

        let err = explain(MonitorError::Submission("bad".into()));
        assert!(!format!("{err:#}").contains("dhgen"));
    }
}
