//! ---
//! phx_section: "05-networking-external-interfaces"
//! phx_subsection: "binary"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Control CLI driving the update pipeline."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
//! Console rendering. Human summaries go to stdout, or a single JSON document
//! with `--json`.

use anyhow::Result;
use phx_core::{ChangeSet, RunRecord, UpdateDetail};
use phx_orchestrator::{
    CheckSummary, ParticipantOutcome, PipelineFailure, PipelineReport, RollbackSummary,
};
use serde::Serialize;
use serde_json::json;

fn emit_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn check(summary: &CheckSummary, json: bool) -> Result<()> {
    if json {
        return emit_json(summary);
    }
    for check in &summary.participants {
        match (&check.info, &check.error) {
            (Some(info), _) => {
                let marker = if info.has_update { "update" } else { "current" };
                println!("{:<12} {:<8} {}", check.participant, marker, info.summary);
                if let UpdateDetail::SourceSync(source) = &info.detail {
                    for commit in &source.pending_commits {
                        println!("{:<21} {} {}", "", short(&commit.hash), commit.subject);
                    }
                }
            }
            (None, Some(error)) => println!("{:<12} {:<8} {error}", check.participant, "error"),
            (None, None) => {}
        }
    }
    if summary.has_updates() {
        println!("Updates pending: {}", summary.pending().join(", "));
    } else {
        println!("Everything is up to date");
    }
    Ok(())
}

pub fn report(report: &PipelineReport, json: bool) -> Result<()> {
    if json {
        return emit_json(report);
    }
    if !report.updated {
        println!("Nothing to update (run {})", report.run_id);
        return Ok(());
    }
    for outcome in &report.outcomes {
        print_outcome(outcome);
    }
    if let Some(tests) = &report.tests {
        println!("tests        {}", tests.summary);
    }
    println!(
        "Update completed in {:.1}s (run {})",
        report.monitoring.duration().as_secs_f64(),
        report.run_id
    );
    Ok(())
}

fn print_outcome(outcome: &ParticipantOutcome) {
    let status = if outcome.result.success { "ok" } else { "failed" };
    println!(
        "{:<12} {:<8} {}",
        outcome.participant, status, outcome.result.summary
    );
    match &outcome.result.changes {
        ChangeSet::SourceSync { files, .. } => {
            for file in files {
                println!("{:<21} {:?} {}", "", file.kind, file.path);
            }
        }
        ChangeSet::Container { container_id, .. } => {
            println!("{:<21} container {}", "", short(container_id));
        }
        ChangeSet::Snapshot { backup_dir, .. } => {
            println!("{:<21} backup {}", "", backup_dir.display());
        }
        ChangeSet::None => {}
    }
}

pub fn rollback(summary: &RollbackSummary, json: bool) -> Result<()> {
    if json {
        return emit_json(summary);
    }
    print_rollback(summary);
    Ok(())
}

fn print_rollback(summary: &RollbackSummary) {
    for name in &summary.attempted {
        match summary.failures.iter().find(|f| &f.participant == name) {
            Some(failure) => println!("{name:<12} {:<8} {}", "failed", failure.error),
            None => println!("{name:<12} {:<8}", "restored"),
        }
    }
    if let Some(report) = summary.store_integrity.as_ref().filter(|r| !r.ok) {
        println!("store        corrupted: {}", report.corrupted.join("; "));
    }
    if let Some(tests) = &summary.tests {
        println!("tests        {}", tests.summary);
    }
    println!("Rollback finished: {}", summary.final_state);
}

pub fn failure(failure: &PipelineFailure, json: bool) -> Result<()> {
    if json {
        return emit_json(&json!({
            "run_id": failure.run_id,
            "success": false,
            "phase": failure.phase,
            "participant": failure.participant,
            "error_kind": failure.error.kind(),
            "error": failure.error.to_string(),
            "final_state": failure.final_state(),
            "outcomes": failure.outcomes,
            "rollback": failure.rollback,
            "monitoring": failure.monitoring,
        }));
    }
    for outcome in &failure.outcomes {
        print_outcome(outcome);
    }
    if let Some(summary) = &failure.rollback {
        print_rollback(summary);
    }
    eprintln!("error: {failure}");
    Ok(())
}

pub fn busy(json: bool) -> Result<()> {
    if json {
        return emit_json(&json!({ "success": false, "error_kind": "busy" }));
    }
    eprintln!("error: an update or rollback is already in progress");
    Ok(())
}

pub fn history(runs: &[RunRecord], json: bool) -> Result<()> {
    if json {
        return emit_json(runs);
    }
    if runs.is_empty() {
        println!("No runs recorded");
        return Ok(());
    }
    for run in runs {
        let outcome = if run.success { "ok" } else { "failed" };
        println!(
            "{} {:<8} {:<7} {:<12} {}",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.operation,
            outcome,
            run.final_state,
            run.error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
