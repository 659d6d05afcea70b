use std::fs;
use std::path::{Path, PathBuf};

use super::*;

const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

const SAMPLE_MANIFEST: &str = r#"
name = "agent-kit"
version = "4.1.0"
min_free_bytes = 1048576

[[components]]
name = "core"
source = "core"
target = "."
patterns = ["*.md"]

[[components]]
name = "commands"
source = "commands"
target = "commands/kit"
patterns = ["**/*.md"]
depends_on = ["core"]

[[components]]
name = "settings"
required = false
source = "settings"
target = "."
patterns = ["settings.json"]
merge = ["settings.json"]
depends_on = ["core"]
"#;

#[test]
fn parse_manifest() {
    let manifest = Manifest::from_toml_str(SAMPLE_MANIFEST).expect("manifest should parse");
    assert_eq!(manifest.name, "agent-kit");
    assert_eq!(manifest.version.to_string(), "4.1.0");
    assert_eq!(manifest.min_free_bytes, Some(1_048_576));
    assert_eq!(manifest.components.len(), 3);

    let core = manifest.component("core").expect("core component");
    assert!(core.required);
    assert!(core.depends_on.is_empty());
    let settings = manifest.component("settings").expect("settings component");
    assert!(!settings.required);
    assert_eq!(settings.merge, vec!["settings.json"]);
}

#[test]
fn parse_json_manifest() {
    let raw = r#"{
        "name": "agent-kit",
        "version": "1.0.0",
        "components": [
            {"name": "core", "source": "core", "target": ".", "patterns": ["*.md"]}
        ]
    }"#;
    let manifest = Manifest::from_json_str(raw).expect("json manifest should parse");
    assert_eq!(manifest.components[0].target, ".");
    assert!(manifest.min_free_bytes.is_none());
}

#[test]
fn load_picks_format_from_extension() {
    let dir = tempfile::tempdir().expect("tempdir");
    let toml_path = dir.path().join("frameset.toml");
    fs::write(&toml_path, SAMPLE_MANIFEST).expect("write toml");
    assert_eq!(Manifest::load(&toml_path).expect("load toml").name, "agent-kit");

    let json_path = dir.path().join("frameset.json");
    fs::write(
        &json_path,
        r#"{"name":"kit","version":"0.1.0","components":[]}"#,
    )
    .expect("write json");
    assert_eq!(Manifest::load(&json_path).expect("load json").name, "kit");
}

#[test]
fn reject_absolute_target() {
    let raw = SAMPLE_MANIFEST.replace("target = \"commands/kit\"", "target = \"/etc/kit\"");
    let err = Manifest::from_toml_str(&raw).expect_err("absolute target must fail");
    assert!(format!("{err:#}").contains("must be relative"));
}

#[test]
fn reject_parent_dir_target() {
    let raw = SAMPLE_MANIFEST.replace("target = \"commands/kit\"", "target = \"../outside\"");
    let err = Manifest::from_toml_str(&raw).expect_err("parent target must fail");
    assert!(format!("{err:#}").contains("'..'"));
}

#[test]
fn reject_dependency_declared_later() {
    let raw = SAMPLE_MANIFEST.replace("depends_on = [\"core\"]\n\n[[components]]\nname = \"settings\"", "depends_on = [\"settings\"]\n\n[[components]]\nname = \"settings\"");
    let err = Manifest::from_toml_str(&raw).expect_err("forward dependency must fail");
    assert!(format!("{err:#}").contains("not declared before it"));
}

#[test]
fn reject_duplicate_component() {
    let raw = r#"
name = "kit"
version = "1.0.0"

[[components]]
name = "core"
source = "a"
target = "."
patterns = ["*"]

[[components]]
name = "core"
source = "b"
target = "."
patterns = ["*"]
"#;
    let err = Manifest::from_toml_str(raw).expect_err("duplicate must fail");
    assert!(format!("{err:#}").contains("duplicate component 'core'"));
}

#[test]
fn reject_component_without_patterns() {
    let raw = r#"
name = "kit"
version = "1.0.0"

[[components]]
name = "core"
source = "a"
target = "."
patterns = []
"#;
    assert!(Manifest::from_toml_str(raw).is_err());
}

#[test]
fn validate_relative_path_accepts_current_dir() {
    validate_relative_path(".").expect("dot is relative");
    validate_relative_path("agents/review").expect("nested relative");
    assert!(validate_relative_path("").is_err());
    assert!(validate_relative_path("a/../b").is_err());
}

#[test]
fn star_stays_within_segment() {
    let pattern = Pattern::parse("*.md").expect("pattern");
    assert!(pattern.matches(Path::new("README.md")));
    assert!(pattern.matches(Path::new(".md")));
    assert!(!pattern.matches(Path::new("docs/README.md")));
    assert!(!pattern.matches(Path::new("README.txt")));
}

#[test]
fn double_star_matches_zero_or_more_segments() {
    let pattern = Pattern::parse("**/*.md").expect("pattern");
    assert!(pattern.matches(Path::new("a.md")));
    assert!(pattern.matches(Path::new("x/y/z/a.md")));
    assert!(!pattern.matches(Path::new("x/y/a.txt")));

    let middle = Pattern::parse("agents/**/prompt.md").expect("pattern");
    assert!(middle.matches(Path::new("agents/prompt.md")));
    assert!(middle.matches(Path::new("agents/review/deep/prompt.md")));
    assert!(!middle.matches(Path::new("other/prompt.md")));
}

#[test]
fn question_mark_matches_one_char() {
    let pattern = Pattern::parse("mode-?.md").expect("pattern");
    assert!(pattern.matches(Path::new("mode-a.md")));
    assert!(!pattern.matches(Path::new("mode-ab.md")));
    assert!(!pattern.matches(Path::new("mode-.md")));
}

#[test]
fn pattern_rejects_escaping_paths() {
    assert!(Pattern::parse("").is_err());
    assert!(Pattern::parse("/etc/*").is_err());
    assert!(Pattern::parse("../*.md").is_err());
    assert!(Pattern::parse("./").is_err());
}

#[test]
fn pattern_set_matches_any() {
    let set = PatternSet::parse(&["*.md", "hooks/*.json"]).expect("set");
    assert!(set.matches(Path::new("CLAUDE.md")));
    assert!(set.matches(Path::new("hooks/pre.json")));
    assert!(!set.matches(Path::new("hooks/pre.sh")));
    assert!(!PatternSet::default().matches(Path::new("anything")));
}

#[test]
fn select_files_walks_sorted_and_filtered() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path();
    fs::create_dir_all(root.join("nested/deeper")).expect("mkdir");
    fs::write(root.join("b.md"), "b").expect("write");
    fs::write(root.join("a.md"), "a").expect("write");
    fs::write(root.join("skip.txt"), "x").expect("write");
    fs::write(root.join("nested/c.md"), "c").expect("write");
    fs::write(root.join("nested/deeper/d.md"), "d").expect("write");

    let top = select_files(root, &PatternSet::parse(&["*.md"]).expect("set")).expect("select");
    assert_eq!(top, vec![PathBuf::from("a.md"), PathBuf::from("b.md")]);

    let all = select_files(root, &PatternSet::parse(&["**/*.md"]).expect("set")).expect("select");
    assert_eq!(
        all,
        vec![
            PathBuf::from("a.md"),
            PathBuf::from("b.md"),
            PathBuf::from("nested/c.md"),
            PathBuf::from("nested/deeper/d.md"),
        ]
    );
}

#[test]
fn hash_known_values() {
    assert_eq!(sha256_hex(b""), EMPTY_SHA256);
    assert_eq!(ContentHash::of_bytes(b"").as_str(), EMPTY_SHA256);
    assert_eq!(ContentHash::of_bytes(b"").short(), &EMPTY_SHA256[..12]);

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("empty");
    fs::write(&path, b"").expect("write");
    assert_eq!(ContentHash::of_file(&path).expect("hash file").as_str(), EMPTY_SHA256);
}

#[test]
fn hash_file_reports_missing_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = sha256_hex_file(&dir.path().join("missing")).expect_err("missing file");
    assert!(format!("{err:#}").contains("failed to open for hashing"));
}
