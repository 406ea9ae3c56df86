mod common;

use std::fs;

use common::{test_site, HASH, START};
use gradequeue::queue::{JobStatus, QueueItem, QueueStatus};
use gradequeue::ledger::{InMemoryLedger, Ledger, RunKey};
use gradequeue::schema::RunSettings;
use gradequeue::{Site, SiteConfig};

#[test]
fn provisioning_issues_commands_in_order() {
    let ts = test_site();
    let mut qi = ts.submit(ts.job(1, "scored"));
    qi.step(&ts.site, &mut QueueStatus::default()).unwrap();
    assert_eq!(qi.status(), JobStatus::Working);
    assert_eq!(qi.runat(), START);

    assert_eq!(
        ts.exec.verbs(),
        vec![
            "helper add",
            "git branch",
            "git init",
            "git fetch",
            "git reset",
            "git branch",
            "helper run",
        ]
    );
    let calls = ts.exec.calls();
    let run = calls.last().unwrap();
    let pid = ts.pid_file(1);
    assert_eq!(run.args[1], format!("-p{}", pid.display()));
    assert_eq!(run.args[2], format!("-P{START} $$ -i"));
    assert!(run.args.contains(&"-T30".to_string()));
    assert!(run.args.contains(&"-h".to_string()));
    assert!(run
        .args
        .iter()
        .any(|a| a.starts_with("-f") && a.ends_with("jail/files.txt")));
    assert_eq!(run.args[run.args.len() - 2], "TERM=xterm-256color");
    assert_eq!(run.args.last().map(String::as_str), Some("make score"));

    let fetch = &calls[3];
    assert_eq!(fetch.args[2], ts.dir.path().join("repo/repo1").display().to_string());
    assert_eq!(fetch.args[3], format!("jailcheckout_{START}"));
    assert_eq!(calls[4].args, vec!["reset", "--hard", HASH]);
    assert_eq!(calls[5].args[..2], ["branch".to_string(), "-D".to_string()]);

    // the row names the liveness marker
    let row = ts.reload(qi.queueid());
    assert_eq!(row.row().lockfile.as_deref(), Some(pid.to_str().unwrap()));
    assert!(!ts.jail_home(1).join("repo/.git").exists());
}

#[test]
fn log_starts_with_run_header_and_commands() {
    let ts = test_site();
    let mut job = ts.job(1, "scored");
    job.tags = vec!["final".into()];
    let mut qi = ts.submit(job);
    qi.step(&ts.site, &mut QueueStatus::default()).unwrap();

    let log = ts
        .log_dir()
        .join(format!("run1.pset1/repo1.pset1.{START}.log"));
    let text = fs::read_to_string(log).unwrap();
    let mut lines = text.lines();
    let header = lines.next().unwrap();
    assert!(header.starts_with("++ {"), "{header}");
    let info: serde_json::Value = serde_json::from_str(&header[3..]).unwrap();
    assert_eq!(info["runner"], "scored");
    assert_eq!(info["timestamp"], START);
    assert_eq!(info["queueid"], qi.queueid());
    assert_eq!(info["tags"], serde_json::json!(["final"]));
    assert!(text.contains("\n++ git fetch --depth=1 "));
    assert!(text.ends_with(common::DEFAULT_OUTPUT));
}

#[test]
fn settings_are_exported_to_the_jail() {
    let ts = test_site();
    let mut settings = RunSettings::new();
    settings.insert("SEED", "42").unwrap();
    settings.insert("GREETING", "it's me").unwrap();
    settings.insert("PATH", "/evil").unwrap();
    let mut job = ts.job(1, "scored");
    job.runsettings = Some(settings);
    let mut qi = ts.submit(job);
    qi.step(&ts.site, &mut QueueStatus::default()).unwrap();

    let home = ts.jail_home(1);
    let sh = fs::read_to_string(home.join("config.sh")).unwrap();
    let mk = fs::read_to_string(home.join("config.mk")).unwrap();
    assert_eq!(sh, "GREETING='it'\\''s me'\nSEED='42'\n");
    assert_eq!(mk, "SEED = 42\n");
}

#[test]
fn stale_jail_is_moved_aside_first() {
    let ts = test_site();
    let jaildir = ts.dir.path().join("jails/1/1");
    fs::create_dir_all(&jaildir).unwrap();
    let mut qi = ts.submit(ts.job(1, "scored"));
    qi.step(&ts.site, &mut QueueStatus::default()).unwrap();

    let verbs = ts.exec.verbs();
    assert_eq!(verbs[..3], ["helper mv", "helper rm", "helper add"]);
    let mv = &ts.exec.calls()[0];
    assert_eq!(mv.args[1], jaildir.display().to_string());
    assert!(mv.args[2].starts_with(&format!("{}~.2023", jaildir.display())));
}

#[test]
fn unresolved_commit_is_looked_up() {
    let ts = test_site();
    let mut job = ts.job(1, "scored");
    job.bhash = None;
    let mut qi = ts.submit(job);
    qi.step(&ts.site, &mut QueueStatus::default()).unwrap();
    assert_eq!(qi.status(), JobStatus::Working);
    assert_eq!(ts.exec.verbs()[0], "git rev-parse");
    assert_eq!(ts.reload(qi.queueid()).hash(), Some(HASH));
}

#[test]
fn busy_target_waits_without_error() {
    let ts = test_site();
    let first = ts.submit(ts.job(1, "scored"));
    let mut second = ts.submit(ts.job(1, "plain"));
    let mut first = ts.reload(first.queueid());
    first.step(&ts.site, &mut QueueStatus::default()).unwrap();
    second.step(&ts.site, &mut QueueStatus::default()).unwrap();
    assert_eq!(second.status(), JobStatus::Scheduled);
    assert_eq!(second.last_error(), None);
    assert_eq!(ts.exec.runs(), 1);
}

#[test]
fn missing_helper_is_a_configuration_error() {
    let ts = test_site();
    let mut config: SiteConfig = ts.site.config.clone();
    config.jail_helper = Some(ts.dir.path().join("nowhere/pa-jail"));
    let site = Site::new(config, gradequeue::store::QueueStore::open_in_memory().unwrap())
        .with_executor(ts.exec.clone());
    let mut qi = QueueItem::new_job(&site, ts.job(1, "scored")).unwrap();
    qi.schedule(&site, 0, None).unwrap();
    assert!(!qi.step(&site, &mut QueueStatus::default()).unwrap());
    assert_eq!(qi.status(), JobStatus::Cancelled);
    let message = qi.last_error().unwrap();
    assert!(message.starts_with("The jail helper "), "{message}");
    assert!(message.ends_with(" has not been installed"), "{message}");
    assert!(ts.exec.calls().is_empty());
}

#[test]
fn bad_run_username_is_rejected_before_anything_is_created() {
    let ts = test_site();
    let mut config = ts.site.config.clone();
    config.psets[0]
        .runners
        .get_mut("scored")
        .unwrap()
        .username = Some("not valid".into());
    let site = Site::new(config, gradequeue::store::QueueStore::open_in_memory().unwrap())
        .with_executor(ts.exec.clone());
    let mut qi = QueueItem::new_job(&site, ts.job(1, "scored")).unwrap();
    qi.schedule(&site, 0, None).unwrap();
    qi.step(&site, &mut QueueStatus::default()).unwrap();
    assert_eq!(qi.last_error(), Some("Bad run_username"));
    assert!(!ts.pid_file(1).exists());
}

#[test]
fn started_runs_are_recorded_under_the_commit() {
    let ts = common::test_site_with(|site| site.with_ledger(Box::new(InMemoryLedger::new())));
    let mut qi = ts.submit(ts.job(2, "scored"));
    qi.step(&ts.site, &mut QueueStatus::default()).unwrap();
    let key = RunKey {
        repoid: 2,
        psetid: 1,
        bhash: HASH.to_string(),
        runner: "scored".to_string(),
    };
    assert_eq!(ts.site.ledger().runs(&key).unwrap(), vec![START]);
}
