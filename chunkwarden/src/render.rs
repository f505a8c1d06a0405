//! Plain-text output for the CLI

use chrono::{DateTime, Local, Utc};
use chunkwarden_core::{MigrationPlan, ResilienceCheckReport, ResilienceStatus, RollbackRecord};

fn local(ts: &DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn bytes(n: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn active(flag: bool) -> &'static str {
    if flag {
        "running"
    } else {
        "idle"
    }
}

pub fn status(status: &ResilienceStatus) {
    println!("Resilience Status");
    println!("=================");
    println!();
    println!("Running:           {}", status.running);
    println!("Uptime:            {}s", status.uptime_seconds);
    println!(
        "Store:             {}",
        if status.store_available {
            "available"
        } else {
            "unavailable"
        }
    );

    let orphans = &status.orphan_summary;
    println!(
        "Orphans:           {} ({}, avg priority {:.2}, {} high priority)",
        orphans.total_orphans,
        bytes(orphans.total_bytes),
        orphans.average_priority,
        orphans.high_priority
    );
    if let Some(oldest) = &orphans.oldest_orphaned_at {
        println!("Oldest orphan:     {}", local(oldest));
    }

    let c = &status.components;
    println!();
    println!(
        "Orphan detector:   {}, {} passes, {} failures, {} found last pass",
        active(c.orphan_detector.active),
        c.orphan_detector.passes,
        c.orphan_detector.failures,
        c.orphan_detector.last_detected
    );
    println!(
        "Migration manager: {}, {} queued, {} completed, {} failed, {} rollbacks",
        active(c.migration_manager.active),
        c.migration_manager.queued,
        c.migration_manager.completed,
        c.migration_manager.failed,
        c.migration_manager.rollbacks
    );
    println!(
        "Cleanup manager:   {}, {} passes, {} cleaned, {} freed",
        active(c.cleanup_manager.active),
        c.cleanup_manager.passes,
        c.cleanup_manager.chunks_cleaned,
        bytes(c.cleanup_manager.bytes_freed)
    );
}

pub fn check_report(report: &ResilienceCheckReport) {
    let stats = &report.cleanup_stats;
    println!("Resilience check complete:");
    println!("  Orphans detected:     {}", report.orphans_detected);
    println!(
        "  Orphans cleaned:      {} of {} eligible ({} skipped, {} failed)",
        stats.cleaned, stats.attempted, stats.skipped, stats.failed
    );
    println!("  Space freed:          {}", bytes(stats.bytes_freed));
    println!("  Expired aliases:      {}", report.expired_aliases_cleaned);
    println!(
        "  Orphans remaining:    {}",
        report.status.orphan_summary.total_orphans
    );

    if !report.errors.is_empty() {
        println!();
        println!("Errors:");
        for error in &report.errors {
            println!("  - {}", error);
        }
    }
}

pub fn plan(plan: &MigrationPlan) {
    println!("Migration {}", plan.migration_id);
    println!("  Strategy:           {}", plan.strategy);
    println!("  Risk:               {}", plan.risk_level);
    println!("  Status:             {}", plan.status);
    println!(
        "  Chunks:             {} source, {} target",
        plan.source_chunks.len(),
        plan.target_chunks.len()
    );
    println!("  Estimated duration: {:.2}", plan.estimated_duration);
    println!(
        "  Rollback estimate:  {:.2}",
        plan.rollback_plan.estimated_rollback_duration
    );
    println!("  Created:            {}", local(&plan.created_at));
    if let Some(done) = &plan.completed_at {
        println!("  Finished:           {}", local(done));
    }
    if let Some(err) = &plan.error_message {
        println!("  Error:              {}", err);
    }
}

pub fn plan_table(plans: &[MigrationPlan]) {
    if plans.is_empty() {
        println!("No migration plans.");
        return;
    }

    println!(
        "{:<36}  {:<11}  {:<6}  {:<9}  {:>6}  {:>8}  CREATED",
        "ID", "STRATEGY", "RISK", "STATUS", "CHUNKS", "ESTIMATE"
    );
    for p in plans {
        println!(
            "{:<36}  {:<11}  {:<6}  {:<9}  {:>6}  {:>8.2}  {}",
            p.migration_id,
            p.strategy.as_str(),
            p.risk_level.as_str(),
            p.status.as_str(),
            p.source_chunks.len(),
            p.estimated_duration,
            local(&p.created_at)
        );
    }
}

pub fn rollback(record: &RollbackRecord) {
    println!(
        "Rollback {} of migration {}: {}",
        record.rollback_id,
        record.migration_id,
        if record.success { "succeeded" } else { "failed" }
    );
    for step in &record.steps_completed {
        println!("  [done] {}", step.as_str());
    }
    if let Some(err) = &record.error_message {
        println!("  Error: {}", err);
    }
}
