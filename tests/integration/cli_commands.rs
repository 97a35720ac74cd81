//! Command routing through `RunContext` against a temporary workspace.

use clap::Parser;
use tempfile::TempDir;
use vitae::cli::{Cli, RunContext};

fn run(ctx: &RunContext, args: &[&str]) -> Result<String, vitae::error::ApiError> {
    let mut argv = vec!["vitae"];
    argv.extend_from_slice(args);
    let cli = Cli::try_parse_from(argv).unwrap();
    ctx.execute(&cli.command)
}

fn context(temp: &TempDir) -> RunContext {
    RunContext::new(temp.path().to_path_buf(), None).unwrap()
}

#[test]
fn merge_writes_ordered_sandboxed_document() {
    let temp = TempDir::new().unwrap();
    let ctx = context(&temp);
    let base = temp.path().join("base.html");
    let podcast = temp.path().join("podcast.html");
    let timeline = temp.path().join("timeline.html");
    let out = temp.path().join("out.html");
    std::fs::write(&base, "<html><head></head><body><h1>cv</h1></body></html>").unwrap();
    std::fs::write(&podcast, "<audio onplay=\"x()\"></audio><script>alert(1)</script>").unwrap();
    std::fs::write(&timeline, "<ol><li>2020</li></ol>").unwrap();

    let message = run(
        &ctx,
        &[
            "merge",
            "--base",
            base.to_str().unwrap(),
            "--fragment",
            &format!("timeline={}", timeline.display()),
            "--fragment",
            &format!("podcast={}", podcast.display()),
            "--order",
            "podcast,timeline",
            "--output",
            out.to_str().unwrap(),
        ],
    )
    .unwrap();
    assert!(message.contains("Merged 2 fragments"));

    let html = std::fs::read_to_string(&out).unwrap();
    assert!(html.find("data-feature=\"podcast\"").unwrap() < html.find("data-feature=\"timeline\"").unwrap());
    assert!(!html.contains("<script"));
    assert!(!html.contains("onplay"));
}

#[test]
fn merge_without_sandbox_keeps_markup() {
    let temp = TempDir::new().unwrap();
    let ctx = context(&temp);
    let base = temp.path().join("base.html");
    let video = temp.path().join("video.html");
    std::fs::write(&base, "<body></body>").unwrap();
    std::fs::write(&video, "<button onclick=\"play()\">Play</button>").unwrap();

    let html = run(
        &ctx,
        &[
            "merge",
            "--base",
            base.to_str().unwrap(),
            "--fragment",
            &format!("video={}", video.display()),
            "--no-sandbox",
        ],
    )
    .unwrap();
    assert!(html.contains("onclick=\"play()\""));
    assert!(!html.contains("Content-Security-Policy"));
}

#[test]
fn merge_rejects_malformed_fragment() {
    let temp = TempDir::new().unwrap();
    let ctx = context(&temp);
    let base = temp.path().join("base.html");
    std::fs::write(&base, "<body></body>").unwrap();
    let err = run(
        &ctx,
        &["merge", "--base", base.to_str().unwrap(), "--fragment", "podcast"],
    )
    .unwrap_err();
    assert!(vitae::cli::map_error(&err).contains("FEATURE=PATH"));
}

#[test]
fn simulate_reports_partial_outcome_and_leaves_checkpoints() {
    let temp = TempDir::new().unwrap();
    let ctx = context(&temp);
    let preview = temp.path().join("preview.html");

    let output = run(
        &ctx,
        &[
            "simulate",
            "--job",
            "sim-test",
            "--feature",
            "skills-viz",
            "--feature",
            "podcast",
            "--feature",
            "video",
            "--fail",
            "video",
            "--debounce-ms",
            "0",
            "--output",
            preview.to_str().unwrap(),
            "--format",
            "json",
        ],
    )
    .unwrap();
    let summary: serde_json::Value = serde_json::from_str(&output).unwrap();
    assert_eq!(summary["outcome"], "partial");
    assert_eq!(summary["completed"], 2);
    assert_eq!(summary["failed"], 1);
    assert_eq!(
        summary["applied_order"],
        serde_json::json!(["podcast", "skills-viz"])
    );

    let html = std::fs::read_to_string(&preview).unwrap();
    assert!(html.contains("data-feature=\"skills-viz\""));
    assert!(!html.contains("data-feature=\"video\""));

    let listed = run(&ctx, &["checkpoints", "list", "--job", "sim-test", "--format", "json"]).unwrap();
    let checkpoints: serde_json::Value = serde_json::from_str(&listed).unwrap();
    let kinds: Vec<&str> = checkpoints
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["checkpoint_type"].as_str().unwrap())
        .collect();
    assert!(kinds.contains(&"feature_completed"));
    assert!(kinds.contains(&"generation_completed"));

    let latest = run(
        &ctx,
        &["checkpoints", "latest", "--job", "sim-test", "--type", "generation_completed"],
    )
    .unwrap();
    assert!(latest.contains("sim-test"));

    let attempts = run(&ctx, &["attempts", "list", "--job", "sim-test"]).unwrap();
    assert!(attempts.contains("generate_video"));
}

#[test]
fn latest_with_unknown_type_lists_valid_types() {
    let temp = TempDir::new().unwrap();
    let ctx = context(&temp);
    let err = run(
        &ctx,
        &["checkpoints", "latest", "--job", "j", "--type", "nonsense"],
    )
    .unwrap_err();
    assert!(err.to_string().contains("parsing_completed"));
}

#[test]
fn config_show_renders_effective_toml() {
    let temp = TempDir::new().unwrap();
    let ctx = context(&temp);
    let shown = run(&ctx, &["config", "show"]).unwrap();
    assert!(shown.contains("[preview]"));
    assert!(shown.contains("unclassified_cap = 2"));
    assert!(run(&ctx, &["config", "validate"]).unwrap().contains("valid"));
}

#[test]
fn gate_reads_checkpoints_and_succeeded_steps() {
    let temp = TempDir::new().unwrap();
    let ctx = context(&temp);
    run(
        &ctx,
        &["simulate", "--job", "gated", "--feature", "timeline", "--debounce-ms", "0"],
    )
    .unwrap();

    let reached = r#"{"kind":"all","conditions":[
        {"kind":"checkpointReached","checkpoint":"generation_completed"},
        {"kind":"stepCompleted","step":"generate_timeline"}
    ]}"#;
    assert_eq!(run(&ctx, &["gate", "--job", "gated", "--condition", reached]).unwrap(), "open");

    let pending = r#"{"kind":"checkpointReached","checkpoint":"preview_generated"}"#;
    assert_eq!(run(&ctx, &["gate", "--job", "gated", "--condition", pending]).unwrap(), "closed");

    let bad = run(&ctx, &["gate", "--job", "gated", "--condition", "{\"kind\":\"eval\"}"]);
    assert!(bad.is_err());
}
