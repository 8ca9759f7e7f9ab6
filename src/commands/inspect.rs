use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::path::PathBuf;

use claimfleet::storage::{HeartbeatWriter, JobRecord, RestoredSession, SessionStore};
use claimfleet::utils::{format_secs, from_unix_secs};

/// Print the queue stored in a session file (falling back through backups)
pub fn inspect(session: PathBuf, backups: usize, heartbeat: Option<PathBuf>, json: bool) -> Result<()> {
    let store = SessionStore::new(session.clone(), backups);
    let restored = store
        .restore()?
        .with_context(|| format!("No readable session at {} or its backups", session.display()))?;

    if json {
        let records: Vec<JobRecord> = restored.jobs.iter().map(JobRecord::from).collect();
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        print!("{}", render_session(&restored, Utc::now()));
    }

    if let Some(path) = heartbeat {
        let writer = HeartbeatWriter::new(path);
        match writer.read() {
            Ok(hb) => println!(
                "\nHeartbeat: {} jobs, {} running, {} ago",
                hb.queue_len,
                hb.running,
                format_secs(hb.age_secs(Utc::now()).max(0))
            ),
            Err(e) => println!("\nHeartbeat unavailable: {e:#}"),
        }
    }

    Ok(())
}

fn render_session(session: &RestoredSession, now: DateTime<Utc>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Session: {}", session.source.display());
    if let Some(saved) = session.saved_at {
        let _ = writeln!(
            out,
            "Saved:   {} ({} ago)",
            saved.format("%Y-%m-%d %H:%M:%S UTC"),
            format_secs((now - saved).num_seconds().max(0))
        );
    }
    let _ = writeln!(out, "Jobs:    {}", session.jobs.len());
    let _ = writeln!(out, "================================");

    let mut jobs = session.jobs.clone();
    jobs.sort_by(|a, b| a.schedule_cmp(b));
    for job in &jobs {
        let due = if job.next_run <= now {
            "due".to_string()
        } else {
            format!("in {}", format_secs((job.next_run - now).num_seconds()))
        };
        let _ = writeln!(
            out,
            "{:>4}  {:<24} {:<12} {:<10} {:<16} retries={} {}",
            job.priority,
            job.name,
            job.target_type,
            job.operation,
            job.account.label,
            job.retry_count,
            due
        );
    }

    if !session.domain_last_access.is_empty() {
        let _ = writeln!(out, "\nLast access per target:");
        let mut targets: Vec<_> = session.domain_last_access.iter().collect();
        targets.sort_by(|a, b| a.0.cmp(b.0));
        for (target, secs) in targets {
            let when = from_unix_secs(*secs)
                .map(|at| format!("{} ago", format_secs((now - at).num_seconds().max(0))))
                .unwrap_or_else(|| "invalid timestamp".to_string());
            let _ = writeln!(out, "  {target:<12} {when}");
        }
    }

    out
}
