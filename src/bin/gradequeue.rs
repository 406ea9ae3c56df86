use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;

use gradequeue::config::ConfigError;
use gradequeue::observability;
use gradequeue::schema::{valid_tag, RunSettings};
use gradequeue::{JobFlags, NewJob, QueueError, QueueItem, RunQueue, Site, SiteConfig};

#[derive(Parser, Debug)]
#[command(name = "gradequeue", version)]
struct Cli {
    /// Site configuration file.
    #[arg(long = "config", short = 'c', default_value = "site.yml", global = true)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan the queue repeatedly, starting jobs and collecting results.
    Serve {
        #[arg(long)]
        once: bool,
        /// Keep scanning until nothing is scheduled or working.
        #[arg(long = "until-idle", conflicts_with = "once")]
        until_idle: bool,
        #[arg(long, short = 'V')]
        verbose: bool,
    },
    /// Enqueue a runner for one or more users. Several users form a chain
    /// that runs one job at a time.
    Enqueue {
        #[arg(long)]
        pset: String,
        #[arg(long)]
        runner: String,
        /// `USER` or `USER:REPOID`.
        #[arg(long = "user", required = true)]
        users: Vec<String>,
        #[arg(long)]
        hash: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// `NAME=VALUE` exported into the jail.
        #[arg(long = "setting")]
        settings: Vec<String>,
        #[arg(long)]
        ensure: bool,
        #[arg(long)]
        unwatched: bool,
        #[arg(long)]
        anonymous: bool,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        #[arg(long)]
        nconcurrent: Option<i64>,
        #[arg(long = "no-schedule")]
        no_schedule: bool,
    },
    Schedule {
        queueid: i64,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        #[arg(long)]
        user: Option<String>,
    },
    Cancel {
        queueid: i64,
    },
    /// One job's row, or counts by status.
    Status {
        queueid: Option<i64>,
    },
    Response {
        queueid: i64,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        write: Option<String>,
        #[arg(long)]
        stop: bool,
    },
    /// Delete stopped jobs older than the given age.
    Clean {
        #[arg(long = "older-than", default_value_t = 7 * 86_400)]
        older_than: i64,
    },
}

fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(QueueError::UnknownJob(_)) = err.downcast_ref::<QueueError>() {
        return 3;
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return 2;
    }
    1
}

fn print(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_item(site: &Site, queueid: i64) -> Result<QueueItem> {
    QueueItem::by_id(site, queueid)?.ok_or_else(|| QueueError::UnknownJob(queueid).into())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?)
}

fn parse_settings(items: &[String]) -> Result<Option<RunSettings>> {
    let mut settings = RunSettings::new();
    for item in items {
        let (name, value) = item
            .split_once('=')
            .ok_or_else(|| anyhow!("setting {item:?} is not NAME=VALUE"))?;
        settings.insert(name, value).map_err(|e| anyhow!(e))?;
    }
    Ok((!settings.is_empty()).then_some(settings))
}

/// Resolve `USER[:REPOID]` to `(cid, repoid)`.
fn parse_target(config: &SiteConfig, spec: &str) -> Result<(i64, i64)> {
    let (user, repo) = match spec.split_once(':') {
        Some((user, repo)) => (user, Some(repo.parse::<i64>().context("bad repository id")?)),
        None => (spec, None),
    };
    let record = config
        .user_by_key(user)
        .ok_or_else(|| anyhow!("unknown user {user:?}"))?;
    let repoid = repo
        .or(record.repoid)
        .ok_or_else(|| anyhow!("user {user:?} has no repository"))?;
    Ok((record.cid, repoid))
}

fn run(cli: Cli) -> Result<()> {
    let config = SiteConfig::load(&cli.config)?;
    let site = Site::open(config).context("can't open queue database")?;

    match cli.command {
        Commands::Serve {
            once,
            until_idle,
            verbose,
        } => {
            let rt = runtime()?;
            let mut rq = RunQueue::new(&site);
            if until_idle {
                let reports = rt.block_on(rq.run_until_idle())?;
                if verbose {
                    print(&json!({ "ok": true, "reports": reports }))?;
                }
            } else {
                let mut summary = rt.block_on(rq.serve(once))?;
                if !verbose {
                    summary.reports.clear();
                }
                print(&json!({ "ok": true, "scan": summary }))?;
            }
        }
        Commands::Enqueue {
            pset,
            runner,
            users,
            hash,
            tags,
            settings,
            ensure,
            unwatched,
            anonymous,
            priority,
            nconcurrent,
            no_schedule,
        } => {
            let psetid = site
                .config
                .pset_by_key(&pset)
                .map(|p| p.id)
                .ok_or_else(|| anyhow!("unknown pset {pset:?}"))?;
            if let Some(tag) = tags.iter().find(|t| !valid_tag(t)) {
                bail!("tag {tag:?} must be non-empty and contain no whitespace");
            }
            let runsettings = parse_settings(&settings)?;
            let mut flags = JobFlags::empty();
            if ensure {
                flags.insert(JobFlags::ENSURE);
            }
            if unwatched {
                flags.insert(JobFlags::UNWATCHED);
            }
            if anonymous {
                flags.insert(JobFlags::ANONYMOUS);
            }
            let targets = users
                .iter()
                .map(|u| parse_target(&site.config, u))
                .collect::<Result<Vec<_>>>()?;
            let chain = if targets.len() > 1 {
                Some(site.store.reserve_chain_id(site.now())?)
            } else {
                None
            };

            let mut items = Vec::with_capacity(targets.len());
            for (cid, repoid) in targets {
                let mut qi = QueueItem::new_job(
                    &site,
                    NewJob {
                        reqcid: cid,
                        cid,
                        psetid,
                        repoid,
                        runner: runner.clone(),
                        bhash: hash.clone(),
                        tags: tags.clone(),
                        runsettings: runsettings.clone(),
                        flags,
                        chain,
                        nconcurrent,
                        runorder: None,
                    },
                )?;
                qi.enqueue(&site)?;
                items.push(qi);
            }
            if !no_schedule {
                // releasing a chain schedules only its head
                if let Some(first) = items.first_mut() {
                    let cid = first.row().cid;
                    first.schedule(&site, priority, Some(cid))?;
                }
                if chain.is_none() {
                    for qi in items.iter_mut().skip(1) {
                        let cid = qi.row().cid;
                        qi.schedule(&site, priority, Some(cid))?;
                    }
                }
            }
            let jobs: Vec<_> = items
                .iter()
                .map(|qi| json!({ "queueid": qi.queueid(), "status": qi.status(), "chain": qi.chain() }))
                .collect();
            print(&json!({ "ok": true, "jobs": jobs }))?;
        }
        Commands::Schedule {
            queueid,
            priority,
            user,
        } => {
            let mut qi = load_item(&site, queueid)?;
            let userid = match user {
                Some(user) => Some(
                    site.config
                        .user_by_key(&user)
                        .map(|u| u.cid)
                        .ok_or_else(|| anyhow!("unknown user {user:?}"))?,
                ),
                None => Some(qi.row().cid),
            };
            qi.schedule(&site, priority, userid)?;
            print(&json!({ "ok": true, "queueid": queueid, "status": qi.status(), "runorder": qi.row().runorder }))?;
        }
        Commands::Cancel { queueid } => {
            let mut qi = load_item(&site, queueid)?;
            let changed = qi.cancel(&site)?;
            print(&json!({ "ok": true, "queueid": queueid, "changed": changed, "status": qi.status() }))?;
        }
        Commands::Status { queueid: Some(queueid) } => {
            let qi = load_item(&site, queueid)?;
            let row = qi.row();
            print(&json!({
                "ok": true,
                "queueid": queueid,
                "job": qi.describe(&site),
                "status": row.status,
                "runat": row.runat,
                "runorder": row.runorder,
                "chain": row.chain,
                "lasterror": qi.last_error(),
            }))?;
        }
        Commands::Status { queueid: None } => {
            let counts: serde_json::Map<String, serde_json::Value> = site
                .store
                .counts_by_status()?
                .into_iter()
                .map(|(status, n)| (status.to_string(), json!(n)))
                .collect();
            print(&json!({ "ok": true, "counts": counts }))?;
        }
        Commands::Response {
            queueid,
            offset,
            write,
            stop,
        } => {
            let mut qi = load_item(&site, queueid)?;
            qi.touch(&site)?;
            let rr = qi.full_response(&site, offset, write.as_deref().map(str::as_bytes), stop)?;
            print(&serde_json::to_value(&rr)?)?;
        }
        Commands::Clean { older_than } => {
            if older_than < 0 {
                bail!("--older-than must not be negative");
            }
            let removed = site.store.clean_finished(site.now() - older_than)?;
            print(&json!({ "ok": true, "removed": removed }))?;
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = observability::init_observability() {
        eprintln!("warning: logging unavailable: {e}");
    }
    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(exit_code(&e));
    }
}
