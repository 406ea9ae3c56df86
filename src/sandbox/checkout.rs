//! Check out one commit of a bare repository into the jail.

use std::path::{Path, PathBuf};

use super::{CommandLog, Invocation};
use crate::error::RunnerError;

/// Locations for one checkout.
#[derive(Debug, Clone)]
pub struct CheckoutPlan<'a> {
    pub repodir: &'a Path,
    /// `<jailhome>/repo`, the directory overlays are applied to.
    pub checkoutdir: PathBuf,
    /// Where the working tree goes; below `checkoutdir` for truncated repos.
    pub clonedir: PathBuf,
    pub hash: &'a str,
    pub branch: String,
}

impl<'a> CheckoutPlan<'a> {
    pub fn new(repodir: &'a Path, jailhome: &Path, subdir: Option<&str>, hash: &'a str, now: i64) -> Self {
        let checkoutdir = jailhome.join("repo");
        let clonedir = match subdir.filter(|d| !d.is_empty()) {
            Some(dir) => checkoutdir.join(dir),
            None => checkoutdir.clone(),
        };
        Self {
            repodir,
            checkoutdir,
            clonedir,
            hash,
            branch: format!("jailcheckout_{now}"),
        }
    }
}

fn git(cwd: &Path) -> Invocation {
    Invocation::new("git")
        .current_dir(cwd)
        .env("GIT_TERMINAL_PROMPT", "0")
}

/// Temporary branch at the commit, shallow fetch, hard reset, and strip
/// all version-control metadata. The temporary branch is always deleted.
pub fn checkout_code(cl: &mut CommandLog<'_>, plan: &CheckoutPlan<'_>) -> Result<(), RunnerError> {
    cl.note(&format!("mkdir {}", plan.checkoutdir.display()))?;
    std::fs::create_dir_all(&plan.clonedir)
        .map_err(|_| RunnerError::env("Can't initialize user repo in jail"))?;

    let branched = cl.run(
        &git(plan.repodir)
            .args(["branch", plan.branch.as_str(), plan.hash]),
    )? == 0;
    let result = if branched {
        fetch_and_reset(cl, plan)
    } else {
        Ok(false)
    };
    if branched {
        cl.run(&git(plan.repodir).args(["branch", "-D", plan.branch.as_str()]))?;
    }
    if !result? {
        return Err(RunnerError::env("Can't check out code into jail"));
    }

    for name in [".git", ".gitcheckout"] {
        let path = plan.clonedir.join(name);
        let removed = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else if path.exists() {
            std::fs::remove_file(&path)
        } else {
            Ok(())
        };
        removed.map_err(|_| RunnerError::env("Can't clean up checkout in jail"))?;
    }
    Ok(())
}

fn fetch_and_reset(cl: &mut CommandLog<'_>, plan: &CheckoutPlan<'_>) -> Result<bool, RunnerError> {
    if !plan.clonedir.join(".git").is_dir()
        && cl.run(&git(&plan.clonedir).args(["init", "--shared=group", "-b", "main"]))? != 0
    {
        return Ok(false);
    }
    let fetch = git(&plan.clonedir)
        .args(["fetch", "--depth=1"])
        .path_arg(plan.repodir)
        .arg(plan.branch.as_str());
    if cl.run(&fetch)? != 0 {
        return Ok(false);
    }
    Ok(cl.run(&git(&plan.clonedir).args(["reset", "--hard", plan.hash]))? == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_repo_clones_below_checkout_dir() {
        let plan = CheckoutPlan::new(
            Path::new("/repo/repo7"),
            Path::new("/jails/1/home/jail61"),
            Some("pset1"),
            "abc",
            99,
        );
        assert_eq!(plan.checkoutdir, PathBuf::from("/jails/1/home/jail61/repo"));
        assert_eq!(plan.clonedir, PathBuf::from("/jails/1/home/jail61/repo/pset1"));
        assert_eq!(plan.branch, "jailcheckout_99");

        let plan = CheckoutPlan::new(Path::new("/r"), Path::new("/h"), Some(""), "abc", 1);
        assert_eq!(plan.clonedir, plan.checkoutdir);
    }
}
