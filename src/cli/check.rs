use std::path::Path;

use crate::config::{load_config, validate, JobKind};

pub fn run(config_path: Option<&Path>) -> anyhow::Result<()> {
    println!("Cadence configuration check\n");

    let config = load_config(config_path)?;
    if let Err(e) = validate(&config) {
        println!("❌ {:#}", e);
        if let Some(hint) = e
            .downcast_ref::<cadence_core::Error>()
            .and_then(cadence_core::Error::suggestion)
        {
            println!("   {}", hint);
        }
        std::process::exit(1);
    }

    let scheduler = &config.scheduler;
    println!(
        "Scheduler: event capacity {}, trigger concurrency {}, job concurrency {}",
        scheduler.event_capacity, scheduler.trigger.max_concurrents, scheduler.job.max_concurrents
    );

    println!("\nTriggers ({}):", config.triggers.len());
    for trigger in &config.triggers {
        let occurrences = trigger
            .max_occurrences
            .map_or_else(|| "unbounded".to_string(), |m| m.to_string());
        println!(
            "  • {} every {}ms, occurrences {}",
            trigger.name, trigger.interval_ms, occurrences
        );
    }

    println!("\nJobs ({}):", config.jobs.len());
    for job in &config.jobs {
        let what = match job.kind {
            JobKind::Log => "log".to_string(),
            JobKind::Command => {
                let line: Vec<&str> = job
                    .command
                    .as_deref()
                    .into_iter()
                    .chain(job.args.iter().map(String::as_str))
                    .collect();
                format!("command `{}`", line.join(" "))
            }
        };
        let state = if job.enabled { "" } else { " (disabled)" };
        println!("  • {} {}{}", job.name, what, state);
    }

    println!("\n✅ Configuration is valid.");
    Ok(())
}
