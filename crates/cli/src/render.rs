//! Plain-text rendering for the terminal.

use std::fmt::Write;

use dhgen_comfyui::events::MonitorEvent;
use dhgen_comfyui::fetcher::Artifacts;
use dhgen_comfyui::progress::JobProgress;
use dhgen_comfyui::session::JobLocation;
use dhgen_core::character::Character;
use dhgen_core::types::JobId;

const BAR_WIDTH: usize = 30;

/// `[#####.....]` filled to `fraction` (clamped to 0..=1).
pub fn progress_bar(fraction: f64, width: usize) -> String {
    let filled = ((fraction.clamp(0.0, 1.0) * width as f64).round() as usize).min(width);
    format!("[{}{}]", "#".repeat(filled), ".".repeat(width - filled))
}

pub fn format_progress(progress: &JobProgress, current_node: Option<&str>) -> String {
    let mut line = format!(
        "{} {:5.1}% ({}/{} nodes done)",
        progress_bar(progress.fraction, BAR_WIDTH),
        progress.percent(),
        progress.completed,
        progress.total,
    );
    if let Some(node) = current_node {
        let _ = write!(line, " node {node}");
    }
    line
}

/// One status line per session event.
pub fn event_line(event: &MonitorEvent) -> String {
    match event {
        MonitorEvent::Connected { client_id } => format!("Connected to ComfyUI (client {client_id})"),
        MonitorEvent::Disconnected { .. } => "Connection lost, reconnecting...".to_string(),
        MonitorEvent::JobProgress {
            progress,
            current_node,
            ..
        } => format_progress(progress, current_node.as_deref()),
        MonitorEvent::JobCompleted { job_id } => format!("Job {job_id} completed"),
        MonitorEvent::JobFailed {
            job_id,
            node_id,
            message,
        } => match node_id {
            Some(node) => format!("Job {job_id} failed at node {node}: {message}"),
            None => format!("Job {job_id} failed: {message}"),
        },
    }
}

pub fn format_location(job_id: &JobId, location: &JobLocation) -> String {
    match location {
        JobLocation::Finished { error: None } => format!("Job {job_id}: finished"),
        JobLocation::Finished { error: Some(message) } => {
            format!("Job {job_id}: finished with error: {message}")
        }
        JobLocation::Running => format!("Job {job_id}: running"),
        JobLocation::Pending => format!("Job {job_id}: pending in queue"),
        JobLocation::NotFound => format!("Job {job_id}: not found"),
    }
}

/// Artifact listing followed by any download failures.
pub fn format_artifacts(artifacts: &Artifacts) -> String {
    if artifacts.is_empty() && artifacts.failures.is_empty() {
        return "No artifacts produced".to_string();
    }

    let mut out = format!("{} artifact(s):", artifacts.len());
    for artifact in artifacts.iter() {
        let _ = write!(out, "\n  [{}] ", artifact.kind().as_str());
        match &artifact.local_path {
            Some(path) => {
                let _ = write!(out, "{}", path.display());
            }
            None => out.push_str(&artifact.uri),
        }
    }
    if !artifacts.failures.is_empty() {
        let _ = write!(out, "\n{} download(s) failed:", artifacts.failures.len());
        for failure in &artifacts.failures {
            let _ = write!(out, "\n  - {failure}");
        }
    }
    out
}

pub fn format_character_list(characters: &[Character]) -> String {
    if characters.is_empty() {
        return "No valid characters found".to_string();
    }
    let mut out = format!("{} character(s):", characters.len());
    for character in characters {
        let _ = write!(out, "\n  {}", character.name);
        if !character.config.description.is_empty() {
            let _ = write!(out, " - {}", character.config.description);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use dhgen_comfyui::fetcher::{Artifact, OutputFile};
    use dhgen_comfyui::error::DownloadError;
    use dhgen_core::media::MediaKind;

    use super::*;

    fn progress(fraction: f64, completed: usize, total: usize) -> JobProgress {
        JobProgress {
            fraction,
            completed,
            running: 0,
            pending: total - completed,
            errored: 0,
            total,
        }
    }

    #[test]
    fn bar_is_clamped() {
        assert_eq!(progress_bar(0.0, 4), "[....]");
        assert_eq!(progress_bar(0.5, 4), "[##..]");
        assert_eq!(progress_bar(1.7, 4), "[####]");
        assert_eq!(progress_bar(-1.0, 4), "[....]");
    }

    #[test]
    fn progress_line_names_current_node() {
        let line = format_progress(&progress(0.5, 1, 2), Some("21"));
        assert!(line.contains(" 50.0%"));
        assert!(line.contains("(1/2 nodes done)"));
        assert!(line.ends_with("node 21"));
    }

    #[test]
    fn failure_line_includes_node() {
        let event = MonitorEvent::JobFailed {
            job_id: JobId::new("p1"),
            node_id: Some("21".into()),
            message: "boom".into(),
        };
        assert_eq!(event_line(&event), "Job p1 failed at node 21: boom");
    }

    #[test]
    fn locations() {
        let id = JobId::new("p1");
        assert_eq!(format_location(&id, &JobLocation::Running), "Job p1: running");
        assert_eq!(
            format_location(&id, &JobLocation::Finished { error: Some("oom".into()) }),
            "Job p1: finished with error: oom"
        );
    }

    #[test]
    fn artifacts_listing() {
        assert_eq!(format_artifacts(&Artifacts::default()), "No artifacts produced");

        let artifacts = Artifacts {
            items: vec![Artifact {
                file: OutputFile {
                    node_id: "40".into(),
                    kind: MediaKind::Video,
                    filename: "talk.mp4".into(),
                    subfolder: String::new(),
                    folder_type: "output".into(),
                },
                uri: "http://host/view?filename=talk.mp4".into(),
                local_path: None,
            }],
            failures: vec![DownloadError {
                filename: "gone.mp4".into(),
                reason: "404".into(),
            }],
        };
        let text = format_artifacts(&artifacts);
        assert!(text.starts_with("1 artifact(s):"));
        assert!(text.contains("[video] http://host/view?filename=talk.mp4"));
        assert!(text.contains("1 download(s) failed:"));
        assert!(text.contains("gone.mp4"));
    }
}
