use std::path::Path;
use std::process::{Command, Output};

use anyhow::{Context, Result};
use holo_restore::restore::format;
use holo_restore::restore::{Mutation, RoutedBatch, VersionedMutation};
use serde_json::json;

const BLOCK_SIZE: usize = 256;

fn run_replay(plan: &Path, out_dir: &Path) -> Result<Output> {
    Command::new(env!("CARGO_BIN_EXE_holo-loader"))
        .arg("replay")
        .arg("--plan")
        .arg(plan)
        .arg("--out-dir")
        .arg(out_dir)
        .arg("--report-timeout-ms")
        .arg("20000")
        .env("NO_COLOR", "1")
        .env("RUST_LOG", "warn")
        .output()
        .context("spawn holo-loader")
}

fn read_applier_log(path: &Path) -> Result<Vec<RoutedBatch>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path)?;
    text.lines()
        .map(|line| serde_json::from_str(line).context("decode applier line"))
        .collect()
}

fn mutation_count(batches: &[RoutedBatch]) -> usize {
    batches.iter().map(RoutedBatch::mutation_count).sum()
}

#[test]
fn replay_writes_routed_mutations_per_applier() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let backup = dir.path().join("backup");
    std::fs::create_dir_all(&backup)?;

    let rows: Vec<(Vec<u8>, Vec<u8>)> = (0..60)
        .map(|i| (format!("key{i:02}").into_bytes(), format!("value-{i}").into_bytes()))
        .collect();
    std::fs::write(backup.join("snap-0"), format::build_range_file(100, &rows, BLOCK_SIZE)?)?;

    let log_muts = vec![
        VersionedMutation::new(101, Mutation::set(b"key05".to_vec(), b"new".to_vec())),
        VersionedMutation::new(102, Mutation::clear_range(b"key20".to_vec(), b"key40".to_vec())),
        VersionedMutation::new(102, Mutation::clear(b"key55".to_vec())),
    ];
    std::fs::write(
        backup.join("log-0"),
        format::build_log_file(100, 110, &[(b"tx-1".to_vec(), log_muts)], 24, BLOCK_SIZE)?,
    )?;
    let later = vec![VersionedMutation::new(
        120,
        Mutation::set(b"key99".to_vec(), b"late".to_vec()),
    )];
    std::fs::write(
        backup.join("log-1"),
        format::build_log_file(110, 130, &[(b"tx-2".to_vec(), later)], 24, BLOCK_SIZE)?,
    )?;

    let plan = json!({
        "backup_url": format!("file://{}", backup.display()),
        "appliers": [1, 2],
        "batches": [
            {
                "batch_id": 1,
                "sample_files": [
                    {"name": "snap-0", "kind": {"type": "range", "version": 100}, "block_size": BLOCK_SIZE}
                ],
                "files": [
                    {"name": "snap-0", "kind": {"type": "range", "version": 100}, "block_size": BLOCK_SIZE},
                    {"name": "log-0", "kind": {"type": "log", "begin_version": 100, "end_version": 110}, "block_size": BLOCK_SIZE}
                ]
            },
            {
                "batch_id": 2,
                "files": [
                    {"name": "log-1", "kind": {"type": "log", "begin_version": 110, "end_version": 130}, "block_size": BLOCK_SIZE}
                ]
            }
        ]
    });
    let plan_path = dir.path().join("plan.json");
    std::fs::write(&plan_path, serde_json::to_vec_pretty(&plan)?)?;
    let out_dir = dir.path().join("out");

    let output = run_replay(&plan_path, &out_dir)?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "replay failed:\n{stderr}");

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    let batches = summary["batches"].as_array().context("batches")?;
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0]["files_loaded"], 2);
    assert_eq!(batches[0]["boundaries"], json!(["<min>", "key30"]));
    assert_eq!(batches[1]["files_loaded"], 1);

    let first = read_applier_log(&out_dir.join("applier-1.jsonl"))?;
    let second = read_applier_log(&out_dir.join("applier-2.jsonl"))?;
    // 60 rows, 1 set, the clear split at key30, 1 clear, 1 later set.
    assert_eq!(mutation_count(&first) + mutation_count(&second), 60 + 1 + 2 + 1 + 1);

    for batch in first.iter().filter(|b| b.batch_id == 1) {
        for (_, mutations) in &batch.entries {
            assert!(mutations.iter().all(|m| m.key.as_slice() < b"key30".as_slice()));
        }
    }
    for batch in second.iter().filter(|b| b.batch_id == 1) {
        for (_, mutations) in &batch.entries {
            assert!(mutations.iter().all(|m| m.key.as_slice() >= b"key30".as_slice()));
        }
    }
    Ok(())
}

#[test]
fn replay_reports_missing_files_and_fails() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let backup = dir.path().join("backup");
    std::fs::create_dir_all(&backup)?;

    let plan = json!({
        "backup_url": backup.display().to_string(),
        "appliers": [1],
        "batches": [
            {
                "batch_id": 1,
                "files": [
                    {"name": "gone", "kind": {"type": "range", "version": 1}, "block_size": 64, "size": 64}
                ]
            }
        ]
    });
    let plan_path = dir.path().join("plan.json");
    std::fs::write(&plan_path, serde_json::to_vec(&plan)?)?;

    let output = run_replay(&plan_path, &dir.path().join("out"))?;
    assert!(!output.status.success());

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    let failed = &summary["batches"][0]["files_failed"][0];
    assert_eq!(failed["file"], "gone");
    assert_eq!(failed["kind"], "not_found");
    assert_eq!(failed["attempts"], 3);
    Ok(())
}
