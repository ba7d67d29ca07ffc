use std::path::Path;
use std::process::ExitCode;

use dhgen_cli::commands;
use dhgen_core::character::CharacterLibrary;

fn output(f: impl FnOnce(&mut Vec<u8>)) -> String {
    let mut buf = Vec::new();
    f(&mut buf);
    String::from_utf8(buf).unwrap()
}

fn make_character(root: &Path, name: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("voice.wav"), b"RIFF").unwrap();
    std::fs::write(dir.join("face.png"), b"\x89PNG").unwrap();
}

#[test]
fn init_then_list() {
    let tmp = tempfile::tempdir().unwrap();
    let library = CharacterLibrary::new(tmp.path().join("characters"));

    let text = output(|out| commands::init(&library, Some("demo"), out).unwrap());
    assert!(text.contains("Example character created"));
    assert!(library.root().join("demo").join("config.json").is_file());

    // The example has no media yet, so it is not listed.
    let text = output(|out| commands::list(&library, out).unwrap());
    assert!(text.contains("No valid characters found"));

    make_character(library.root(), "alice");
    library.clear_cache();
    let text = output(|out| commands::list(&library, out).unwrap());
    assert!(text.starts_with("1 character(s):"));
    assert!(text.contains("alice"));
}

#[test]
fn validate_sets_exit_code() {
    let tmp = tempfile::tempdir().unwrap();
    make_character(tmp.path(), "alice");
    std::fs::create_dir_all(tmp.path().join("mute")).unwrap();
    std::fs::write(tmp.path().join("mute").join("face.png"), b"\x89PNG").unwrap();
    let library = CharacterLibrary::new(tmp.path());

    let mut out = Vec::new();
    let code = commands::validate(&library, "alice", &mut out).unwrap();
    assert_eq!(code, ExitCode::SUCCESS);

    let mut out = Vec::new();
    let code = commands::validate(&library, "mute", &mut out).unwrap();
    assert_eq!(code, ExitCode::from(1));
    assert!(String::from_utf8(out).unwrap().contains("Missing reference audio file"));
}

#[test]
fn info_shows_chosen_files() {
    let tmp = tempfile::tempdir().unwrap();
    make_character(tmp.path(), "alice");
    let library = CharacterLibrary::new(tmp.path());

    let text = output(|out| commands::info(&library, "alice", out).unwrap());
    assert!(text.contains("voice.wav"));
    assert!(text.contains("face.png (image)"));
    assert!(text.contains("Positive prompt:"));
}

#[test]
fn cache_reports_and_clears() {
    let tmp = tempfile::tempdir().unwrap();
    make_character(tmp.path(), "alice");
    let library = CharacterLibrary::new(tmp.path());

    let text = output(|out| commands::cache(&library, true, out).unwrap());
    assert!(text.contains("Cache: 1 entries (1 active, 0 expired)"));
    assert!(text.contains("Cache cleared"));
    assert_eq!(library.cache_stats().total, 0);
}
