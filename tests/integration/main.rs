//! Integration tests for Nitrate

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use nitrate::cache::PersistentStore;
    use nitrate::config::Config;
    use nitrate::entity::EntityClass;
    use nitrate::rpc::MemoryRemote;
    use nitrate::{CacheLevel, Nitrate};
    use predicates::prelude::*;
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    struct Sandbox {
        dir: TempDir,
    }

    impl Sandbox {
        fn new() -> Self {
            let sandbox = Self {
                dir: TempDir::new().unwrap(),
            };
            std::fs::write(
                sandbox.config_path(),
                format!("[cache]\nfile = '{}'\n", sandbox.cache_path().display()),
            )
            .unwrap();
            sandbox
        }

        fn config_path(&self) -> PathBuf {
            self.dir.path().join("config.toml")
        }

        fn cache_path(&self) -> PathBuf {
            self.dir.path().join("cache.json.gz")
        }

        fn nitrate(&self) -> Command {
            let mut cmd = cargo_bin_cmd!("nitrate");
            cmd.env_remove("NITRATE_CACHE")
                .env_remove("NITRATE_LOG")
                .arg("--config")
                .arg(self.config_path());
            cmd
        }

        /// Write a cache file the way a library user at level 3 would
        fn seed_cache(&self) {
            let remote = MemoryRemote::new();
            remote.insert(EntityClass::TestPlan, 7, json!({ "name": "Smoke" }));
            remote.insert(EntityClass::Tag, 5, json!({ "name": "smoke" }));

            let nitrate = Nitrate::new(&Config::default(), remote).unwrap();
            nitrate.fetch(EntityClass::TestPlan, 7).unwrap();
            nitrate.fetch(EntityClass::Tag, 5).unwrap();
            nitrate.save_to(&self.cache_path()).unwrap();
        }
    }

    fn nitrate() -> Command {
        cargo_bin_cmd!("nitrate")
    }

    #[test]
    fn help_displays() {
        nitrate()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("object cache"));
    }

    #[test]
    fn version_displays() {
        nitrate()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("nitrate"));
    }

    #[test]
    fn config_path() {
        let sandbox = Sandbox::new();
        sandbox
            .nitrate()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let sandbox = Sandbox::new();
        sandbox
            .nitrate()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[batch]"))
            .stdout(predicate::str::contains("max_calls = 10"));
    }

    #[test]
    fn config_init_refuses_to_overwrite() {
        let sandbox = Sandbox::new();
        sandbox
            .nitrate()
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        sandbox
            .nitrate()
            .args(["config", "init", "--force"])
            .assert()
            .success()
            .stdout(predicate::str::contains("initialized"));
    }

    #[test]
    fn config_set_persists() {
        let sandbox = Sandbox::new();
        sandbox
            .nitrate()
            .args(["config", "set", "cache.level", "persistent"])
            .assert()
            .success();

        sandbox
            .nitrate()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("level = 3"));
    }

    #[test]
    fn config_set_does_not_persist_env_override() {
        let sandbox = Sandbox::new();
        sandbox
            .nitrate()
            .env("NITRATE_CACHE", "0")
            .args(["config", "set", "batch.max_calls", "5"])
            .assert()
            .success();

        let written = std::fs::read_to_string(sandbox.config_path()).unwrap();
        assert!(written.contains("max_calls = 5"));
        assert!(written.contains("level = 2"));
        assert!(!written.contains("level = 0"));
    }

    #[test]
    fn config_set_unknown_key() {
        let sandbox = Sandbox::new();
        sandbox
            .nitrate()
            .args(["config", "set", "vm.name", "x"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown config key"));
    }

    #[test]
    fn invalid_cache_level_env() {
        let sandbox = Sandbox::new();
        sandbox
            .nitrate()
            .env("NITRATE_CACHE", "9")
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid cache level"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn cache_path_follows_config() {
        let sandbox = Sandbox::new();
        sandbox
            .nitrate()
            .args(["cache", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("cache.json.gz"));
    }

    #[test]
    fn cache_show_without_file() {
        let sandbox = Sandbox::new();
        sandbox
            .nitrate()
            .args(["cache", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cache file"));
    }

    #[test]
    fn cache_show_lists_classes() {
        let sandbox = Sandbox::new();
        sandbox.seed_cache();

        sandbox
            .nitrate()
            .args(["cache", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("TestPlan"))
            .stdout(predicate::str::contains("Total: 2 entries"));

        sandbox
            .nitrate()
            .args(["cache", "show", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"entries\": 2"));
    }

    #[test]
    fn cache_sweep_keeps_fresh_entries() {
        let sandbox = Sandbox::new();
        sandbox.seed_cache();

        sandbox
            .nitrate()
            .args(["cache", "sweep"])
            .assert()
            .success()
            .stdout(predicate::str::contains("kept 2"));
        assert!(!PersistentStore::lock_path_for(&sandbox.cache_path()).exists());
    }

    #[test]
    fn cache_sweep_respects_lock() {
        let sandbox = Sandbox::new();
        sandbox.seed_cache();
        let _owner = PersistentStore::open(sandbox.cache_path()).unwrap();

        sandbox
            .nitrate()
            .args(["cache", "sweep"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("locked by another process"));
    }

    #[test]
    fn cache_clear_removes_file() {
        let sandbox = Sandbox::new();
        sandbox.seed_cache();

        sandbox
            .nitrate()
            .args(["cache", "clear", "--yes"])
            .assert()
            .success()
            .stdout(predicate::str::contains("cleared"));
        assert!(!sandbox.cache_path().exists());
    }

    #[test]
    fn corrupt_cache_file_reports_hint() {
        let sandbox = Sandbox::new();
        std::fs::write(sandbox.cache_path(), b"not a cache").unwrap();

        sandbox
            .nitrate()
            .args(["cache", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unreadable"))
            .stderr(predicate::str::contains("nitrate cache clear"));
    }

    #[test]
    fn persistent_level_is_read_back_by_library() {
        let sandbox = Sandbox::new();
        sandbox.seed_cache();

        let mut config = Config::default();
        config.cache.level = CacheLevel::Persistent;
        config.cache.file = Some(sandbox.cache_path());
        let remote = std::rc::Rc::new(MemoryRemote::new());
        let nitrate = Nitrate::new(&config, remote.clone()).unwrap();

        let tag = nitrate.get_by_key(EntityClass::Tag, &["smoke"]).unwrap();
        assert_eq!(tag.id(), Some(5));
        assert_eq!(remote.call_count(), 0);
        assert_cache_exists(&sandbox.cache_path());
    }

    fn assert_cache_exists(path: &Path) {
        assert!(PersistentStore::peek(path).unwrap().is_some());
    }
}

mod library_tests {
    use nitrate::cache::{PersistentStore, StoreMode};
    use nitrate::clock::ManualClock;
    use nitrate::config::Config;
    use nitrate::entity::{CaseStatus, CodedEnum, EntityClass, Priority};
    use nitrate::rpc::MemoryRemote;
    use nitrate::{CacheLevel, Expiration, Nitrate, NitrateError};
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use std::rc::Rc;
    use tempfile::TempDir;

    fn config(level: CacheLevel) -> Config {
        let mut config = Config::default();
        config.cache.level = level;
        config
    }

    fn seeded() -> Rc<MemoryRemote> {
        let remote = MemoryRemote::new();
        remote.insert(EntityClass::Product, 1, json!({ "name": "Fedora", "description": "" }));
        remote.insert(EntityClass::Build, 3, json!({ "name": "beta", "product": 1 }));
        remote.insert(EntityClass::Tag, 5, json!({ "name": "smoke" }));
        for id in 1..=7 {
            remote.insert(
                EntityClass::TestCase,
                id,
                json!({ "summary": format!("case {}", id), "status": 2, "priority": 3 }),
            );
        }
        remote.insert(EntityClass::TestPlan, 9, json!({ "name": "Release", "product": 1 }));
        remote.relate(EntityClass::PlanCases, 9, &[1, 2, 3]);
        Rc::new(remote)
    }

    #[test]
    fn identity_is_unique_across_key_forms() {
        let remote = seeded();
        let nitrate = Nitrate::new(&config(CacheLevel::Objects), remote.clone()).unwrap();

        let by_key = nitrate.get_by_key(EntityClass::Build, &["beta", "1"]).unwrap();
        assert_eq!(by_key.resolve_id().unwrap(), 3);
        let by_id = nitrate.get(EntityClass::Build, 3).unwrap();
        let again = nitrate.get_by_key(EntityClass::Build, &["beta", "1"]).unwrap();

        assert!(by_id.same_instance(&by_key));
        assert!(again.same_instance(&by_key));
        assert_eq!(remote.count("Build.filter"), 1);
        assert_eq!(remote.count("Build.get"), 0);

        let tag_by_id = nitrate.get(EntityClass::Tag, 5).unwrap();
        let tag_by_name = nitrate.get_by_key(EntityClass::Tag, &["smoke"]).unwrap();
        assert!(tag_by_id.same_instance(&tag_by_name));
        assert_eq!(tag_by_name.resolve_id().unwrap(), 5);
        assert_eq!(remote.count("Tag.filter"), 1);
        assert_eq!(remote.count("Tag.get"), 0);
    }

    #[test]
    fn changes_level_edits_are_written_on_close() {
        let remote = seeded();
        let nitrate = Nitrate::new(&config(CacheLevel::Changes), remote.clone()).unwrap();
        let case = nitrate.get(EntityClass::TestCase, 4).unwrap();
        case.set("notes", "closing").unwrap();
        assert_eq!(remote.count("TestCase.update"), 0);

        nitrate.close().unwrap();
        assert_eq!(remote.record(EntityClass::TestCase, 4).unwrap()["notes"], "closing");
    }

    #[test]
    fn coded_fields_decode() {
        let nitrate = Nitrate::new(&config(CacheLevel::Objects), seeded()).unwrap();
        let case = nitrate.get(EntityClass::TestCase, 1).unwrap();

        assert_eq!(case.get_coded::<CaseStatus>("status").unwrap().name(), "CONFIRMED");
        assert_eq!(case.get_coded::<Priority>("priority").unwrap().code(), 3);

        case.set("priority", Priority::from_name("P1").unwrap().to_value()).unwrap();
        assert!(case.is_dirty());
    }

    #[test]
    fn refresh_discards_local_changes() {
        let remote = seeded();
        let nitrate = Nitrate::new(&config(CacheLevel::Objects), remote.clone()).unwrap();
        let case = nitrate.fetch(EntityClass::TestCase, 3).unwrap();

        case.set("summary", "draft").unwrap();
        assert_eq!(case.get_str("summary").unwrap().as_deref(), Some("draft"));
        case.refresh().unwrap();

        assert!(!case.is_dirty());
        assert_eq!(case.get_str("summary").unwrap().as_deref(), Some("case 3"));
        assert_eq!(remote.count("TestCase.get"), 2);
    }

    #[test]
    fn batch_slices_by_max_calls() {
        let remote = seeded();
        let mut config = config(CacheLevel::Objects);
        config.batch.max_calls = 3;
        let nitrate = Nitrate::new(&config, remote.clone()).unwrap();

        let cases: Vec<_> = (1..=7)
            .map(|id| nitrate.fetch(EntityClass::TestCase, id).unwrap())
            .collect();
        remote.reset_log();

        let ((), results) = nitrate
            .batch(|_| {
                for case in &cases {
                    case.set("notes", "triaged")?;
                    case.update()?;
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(results.len(), 7);
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(remote.batch_count(), 3);
        assert_eq!(remote.direct_count("TestCase.update"), 0);
        assert!(cases.iter().all(|c| !c.is_dirty()));
    }

    #[test]
    fn batch_closure_failure_still_sends() {
        let remote = seeded();
        let nitrate = Nitrate::new(&config(CacheLevel::Objects), remote.clone()).unwrap();
        let case = nitrate.fetch(EntityClass::TestCase, 1).unwrap();

        let outcome: Result<((), _), _> = nitrate.batch(|n| {
            case.set("notes", "queued")?;
            case.update()?;
            n.get(EntityClass::Product, 1)?.set("name", "nope")
        });

        assert!(matches!(outcome, Err(NitrateError::ReadOnly(EntityClass::Product))));
        assert!(!nitrate.in_batch());
        assert!(!case.is_dirty());
        assert_eq!(remote.record(EntityClass::TestCase, 1).unwrap()["notes"], "queued");
    }

    #[test]
    fn changes_level_defers_writes_without_caching() {
        let remote = seeded();
        let nitrate = Nitrate::new(&config(CacheLevel::Changes), remote.clone()).unwrap();

        let case = nitrate.get(EntityClass::TestCase, 2).unwrap();
        case.set("notes", "later").unwrap();
        assert_eq!(remote.count("TestCase.update"), 0);
        assert!(!nitrate.get(EntityClass::TestCase, 2).unwrap().same_instance(&case));

        case.dispose().unwrap();
        assert_eq!(remote.count("TestCase.update"), 1);
    }

    #[test]
    fn plan_cases_container() {
        let remote = seeded();
        let nitrate = Nitrate::new(&config(CacheLevel::Objects), remote.clone()).unwrap();

        let plan = nitrate.get(EntityClass::TestPlan, 9).unwrap();
        let cases = plan.related(EntityClass::PlanCases).unwrap();
        assert_eq!(cases.member_count().unwrap(), 3);

        let summaries: Vec<_> = cases
            .members()
            .unwrap()
            .iter()
            .map(|c| c.get("summary").unwrap())
            .collect();
        assert_eq!(summaries, vec![json!("case 1"), json!("case 2"), json!("case 3")]);
        assert_eq!(remote.count("TestCase.get"), 0);

        cases.add(&nitrate.get(EntityClass::TestCase, 4).unwrap()).unwrap();
        cases.update().unwrap();
        assert_eq!(remote.members(EntityClass::PlanCases, 9), vec![1, 2, 3, 4]);
    }

    #[test]
    fn persistent_cache_survives_restart() {
        let dir = TempDir::new().unwrap();
        let mut config = config(CacheLevel::Persistent);
        config.cache.file = Some(dir.path().join("cache.json.gz"));
        let remote = seeded();

        {
            let nitrate = Nitrate::new(&config, remote.clone()).unwrap();
            let plan = nitrate.get(EntityClass::TestPlan, 9).unwrap();
            plan.related(EntityClass::PlanCases).unwrap().load().unwrap();
            nitrate.fetch(EntityClass::Tag, 5).unwrap();
        }

        remote.reset_log();
        let nitrate = Nitrate::new(&config, remote.clone()).unwrap();
        assert_eq!(nitrate.store_mode(), Some(StoreMode::ReadWrite));

        let cases = nitrate.get(EntityClass::PlanCases, 9).unwrap();
        assert!(cases.is_fetched());
        assert_eq!(cases.member_count().unwrap(), 3);
        let tag = nitrate.get_by_key(EntityClass::Tag, &["smoke"]).unwrap();
        assert_eq!(tag.id(), Some(5));
        assert_eq!(remote.call_count(), 0);
    }

    #[test]
    fn dirty_entries_are_not_persisted() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("cache.json.gz");
        let mut config = config(CacheLevel::Persistent);
        config.cache.file = Some(file.clone());
        let remote = seeded();

        let nitrate = Nitrate::new(&config, remote.clone()).unwrap();
        let clean = nitrate.fetch(EntityClass::TestCase, 1).unwrap();
        let dirty = nitrate.fetch(EntityClass::TestCase, 2).unwrap();
        dirty.set("notes", "unsaved").unwrap();
        assert!(nitrate.save().unwrap());

        let snapshot = PersistentStore::peek(&file).unwrap().unwrap();
        let ids: Vec<i64> = snapshot.classes["TestCase"].entries.keys().copied().collect();
        assert_eq!(ids, vec![1]);
        assert!(clean.is_fetched());
    }

    #[test]
    fn concurrent_process_gets_read_only_store() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("cache.json.gz");
        let mut config = config(CacheLevel::Persistent);
        config.cache.file = Some(file.clone());

        let first = Nitrate::new(&config, seeded()).unwrap();
        let second = Nitrate::new(&config, seeded()).unwrap();
        assert_eq!(first.store_mode(), Some(StoreMode::ReadWrite));
        assert_eq!(second.store_mode(), Some(StoreMode::ReadOnly));

        second.fetch(EntityClass::Tag, 5).unwrap();
        second.close().unwrap();
        assert!(!file.exists());
        assert!(PersistentStore::lock_path_for(&file).exists());

        first.fetch(EntityClass::Tag, 5).unwrap();
        first.close().unwrap();
        assert!(file.exists());
        assert!(!PersistentStore::lock_path_for(&file).exists());
    }

    #[test]
    fn expired_persisted_entries_are_dropped_on_load() {
        let dir = TempDir::new().unwrap();
        let mut config = config(CacheLevel::Persistent);
        config.cache.file = Some(dir.path().join("cache.json.gz"));
        config
            .expiration
            .classes
            .insert("TestCase".to_string(), Expiration::from_secs(600));
        let remote = seeded();
        let clock = ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap());

        {
            let nitrate = Nitrate::with_clock(&config, remote.clone(), clock.clone()).unwrap();
            nitrate.fetch(EntityClass::TestCase, 1).unwrap();
            nitrate.fetch(EntityClass::Product, 1).unwrap();
        }

        clock.advance(Duration::seconds(700));
        remote.reset_log();
        let nitrate = Nitrate::with_clock(&config, remote.clone(), clock.clone()).unwrap();
        assert!(!nitrate.get(EntityClass::TestCase, 1).unwrap().is_fetched());
        assert!(nitrate.get(EntityClass::Product, 1).unwrap().is_fetched());
    }

    #[test]
    fn level_can_change_at_runtime() {
        let dir = TempDir::new().unwrap();
        let mut config = config(CacheLevel::Objects);
        config.cache.file = Some(dir.path().join("cache.json.gz"));
        let nitrate = Nitrate::new(&config, seeded()).unwrap();

        assert!(nitrate.store_mode().is_none());
        nitrate.set_level(CacheLevel::Persistent).unwrap();
        assert_eq!(nitrate.store_mode(), Some(StoreMode::ReadWrite));
        nitrate.fetch(EntityClass::Tag, 5).unwrap();

        nitrate.set_level(CacheLevel::None).unwrap();
        assert!(nitrate.store_mode().is_none());
        assert!(dir.path().join("cache.json.gz").exists());
        let a = nitrate.get(EntityClass::Tag, 5).unwrap();
        assert!(!a.is_fetched());
    }
}
