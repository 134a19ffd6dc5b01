//! Cache command - inspect and maintain the persistent cache file

use crate::cache::{
    CacheLevel, ExpirationPolicy, LockInfo, PersistentStore, Registry, Snapshot, SweepReport,
};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::Config;
use crate::error::{NitrateError, NitrateResult};
use chrono::{DateTime, Utc};
use console::style;
use serde::Serialize;
use std::io::{self, Write};
use std::path::Path;
use tracing::debug;

/// Execute the cache command
pub fn execute(args: CacheArgs, config: &Config) -> NitrateResult<()> {
    let path = config.cache.file_path();
    debug!("Cache file: {}", path.display());

    match args.action {
        CacheAction::Path => {
            println!("{}", path.display());
            Ok(())
        }
        CacheAction::Show { format } => show_cache(&path, format),
        CacheAction::Sweep { dry_run } => sweep_cache(&path, &config.expiration.policy(), dry_run),
        CacheAction::Clear { yes } => clear_cache(&path, yes),
    }
}

#[derive(Debug, Serialize)]
struct ClassSummary {
    class: String,
    entries: usize,
    oldest: Option<DateTime<Utc>>,
    newest: Option<DateTime<Utc>>,
}

fn summarize(snapshot: &Snapshot) -> Vec<ClassSummary> {
    snapshot
        .classes
        .iter()
        .map(|(class, section)| {
            let fetched = section.entries.values().map(|e| e.fetched_at);
            ClassSummary {
                class: class.clone(),
                entries: section.entries.len(),
                oldest: fetched.clone().min(),
                newest: fetched.max(),
            }
        })
        .collect()
}

fn show_cache(path: &Path, format: OutputFormat) -> NitrateResult<()> {
    let Some(snapshot) = PersistentStore::peek(path)? else {
        println!("No cache file at {}", path.display());
        return Ok(());
    };
    let lock = PersistentStore::lock_owner(&PersistentStore::lock_path_for(path)).unwrap_or(None);
    let classes = summarize(&snapshot);

    match format {
        OutputFormat::Table => print_cache_table(path, &snapshot, lock.as_ref(), &classes),
        OutputFormat::Json => print_cache_json(path, &snapshot, lock.as_ref(), &classes)?,
        OutputFormat::Plain => print_cache_plain(&classes),
    }
    Ok(())
}

fn print_cache_table(path: &Path, snapshot: &Snapshot, lock: Option<&LockInfo>, classes: &[ClassSummary]) {
    println!("File:  {}", path.display());
    println!("Saved: {}", snapshot.saved_at.format("%Y-%m-%d %H:%M:%S"));
    match lock {
        Some(lock) => println!(
            "Lock:  {} (pid {})",
            style("held").yellow(),
            lock.pid
        ),
        None => println!("Lock:  {}", style("free").green()),
    }
    println!();

    println!("{:<14} {:>8} {:<20} {:<20}", "CLASS", "ENTRIES", "OLDEST", "NEWEST");
    println!("{}", "-".repeat(64));

    let format_time = |t: Option<DateTime<Utc>>| {
        t.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string())
    };
    for summary in classes {
        println!(
            "{:<14} {:>8} {:<20} {:<20}",
            summary.class,
            summary.entries,
            format_time(summary.oldest),
            format_time(summary.newest)
        );
    }

    println!();
    println!("Total: {} entries", snapshot.entry_count());
}

fn print_cache_json(
    path: &Path,
    snapshot: &Snapshot,
    lock: Option<&LockInfo>,
    classes: &[ClassSummary],
) -> NitrateResult<()> {
    #[derive(Serialize)]
    struct CacheJson<'a> {
        path: String,
        version: u32,
        saved_at: String,
        lock: Option<&'a LockInfo>,
        entries: usize,
        classes: &'a [ClassSummary],
    }

    let json = CacheJson {
        path: path.display().to_string(),
        version: snapshot.version,
        saved_at: snapshot.saved_at.to_rfc3339(),
        lock,
        entries: snapshot.entry_count(),
        classes,
    };
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

fn print_cache_plain(classes: &[ClassSummary]) {
    for summary in classes {
        println!("{} {}", summary.class, summary.entries);
    }
}

/// Sweep the file at `path`; `None` when there is no file
fn sweep_file(
    path: &Path,
    policy: &ExpirationPolicy,
    dry_run: bool,
    now: DateTime<Utc>,
) -> NitrateResult<Option<SweepReport>> {
    let store = PersistentStore::open(path)?;
    if !store.is_owner() {
        return Err(NitrateError::LockContention(path.to_path_buf()));
    }
    let Some(snapshot) = store.load()? else {
        return Ok(None);
    };

    let mut registry = Registry::new(CacheLevel::Persistent, policy.clone());
    let report = registry.restore(&snapshot, now).sweep;
    if !dry_run && report.evicted() > 0 {
        store.save(&registry.snapshot(now))?;
    }
    Ok(Some(report))
}

fn sweep_cache(path: &Path, policy: &ExpirationPolicy, dry_run: bool) -> NitrateResult<()> {
    let Some(report) = sweep_file(path, policy, dry_run, Utc::now())? else {
        println!("No cache file at {}", path.display());
        return Ok(());
    };

    let verb = if dry_run { "Would remove" } else { "Removed" };
    println!(
        "{} {} {} expired entr{}, kept {}",
        style("✓").green(),
        verb,
        report.expired,
        if report.expired == 1 { "y" } else { "ies" },
        report.kept()
    );
    Ok(())
}

fn clear_cache(path: &Path, skip_confirm: bool) -> NitrateResult<()> {
    if !path.exists() {
        println!("No cache file to clear.");
        return Ok(());
    }

    println!("This will remove {}", style(path.display()).red());
    if !skip_confirm {
        print!("Are you sure? [y/N] ");
        let _ = io::stdout().flush();

        let mut input = String::new();
        if io::stdin().read_line(&mut input).is_err() {
            println!("Failed to read input, aborting.");
            return Ok(());
        }

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    let store = PersistentStore::open(path)?;
    store.discard()?;
    println!("{} cleared cache file", style("✓").green());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::{ClassSection, EntryDump, SNAPSHOT_VERSION};
    use crate::cache::Expiration;
    use crate::entity::EntityClass;
    use chrono::Duration;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn entry(fetched_at: DateTime<Utc>) -> EntryDump {
        EntryDump {
            fetched_at,
            fields: serde_json::Map::new(),
            members: None,
        }
    }

    fn snapshot(now: DateTime<Utc>) -> Snapshot {
        let mut plans = BTreeMap::new();
        plans.insert(1, entry(now - Duration::hours(3)));
        plans.insert(2, entry(now - Duration::minutes(5)));
        let mut classes = BTreeMap::new();
        classes.insert("TestPlan".to_string(), ClassSection { entries: plans });
        Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: now,
            classes,
        }
    }

    #[test]
    fn summary_reports_age_range() {
        let now = Utc::now();
        let summary = summarize(&snapshot(now));
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].entries, 2);
        assert_eq!(summary[0].oldest, Some(now - Duration::hours(3)));
        assert_eq!(summary[0].newest, Some(now - Duration::minutes(5)));
    }

    #[test]
    fn sweep_rewrites_file_without_expired_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json.gz");
        let now = Utc::now();
        PersistentStore::write_snapshot(&path, &snapshot(now)).unwrap();
        let mut policy = ExpirationPolicy::default();
        policy.set(EntityClass::TestPlan, Expiration::from_secs(3600));

        let report = sweep_file(&path, &policy, true, now).unwrap().unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(PersistentStore::peek(&path).unwrap().unwrap().entry_count(), 2);

        sweep_file(&path, &policy, false, now).unwrap().unwrap();
        let kept = PersistentStore::peek(&path).unwrap().unwrap();
        assert_eq!(kept.classes["TestPlan"].entries.keys().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn sweep_needs_the_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json.gz");
        let _owner = PersistentStore::open(&path).unwrap();

        let err = sweep_file(&path, &ExpirationPolicy::default(), false, Utc::now()).unwrap_err();
        assert!(matches!(err, NitrateError::LockContention(_)));
    }

    #[test]
    fn sweep_without_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json.gz");
        let report = sweep_file(&path, &ExpirationPolicy::default(), false, Utc::now()).unwrap();
        assert!(report.is_none());
    }
}
