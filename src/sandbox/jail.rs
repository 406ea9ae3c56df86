//! Invocations of the external jail helper (`add`, `mv`, `rm --bg`, `run`).

use chrono::DateTime;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{CommandLog, Invocation};
use crate::error::RunnerError;

const MAX_REMOVE_TRIES: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailHelper {
    path: PathBuf,
}

impl JailHelper {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The helper must exist and be executable before anything is created.
    pub fn check(&self) -> Result<(), RunnerError> {
        let meta = std::fs::metadata(&self.path).map_err(|_| {
            RunnerError::config(format!(
                "The jail helper {} has not been installed",
                self.path.display()
            ))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
                return Err(RunnerError::config(format!(
                    "The jail helper {} is not executable",
                    self.path.display()
                )));
            }
        }
        #[cfg(not(unix))]
        let _ = meta;
        Ok(())
    }

    fn invocation(&self, verb: &str) -> Invocation {
        Invocation::new(&self.path).arg(verb)
    }

    pub fn add(&self, jaildir: &Path, username: &str) -> Invocation {
        self.invocation("add").path_arg(jaildir).arg(username)
    }

    pub fn mv(&self, from: &Path, to: &Path) -> Invocation {
        self.invocation("mv").path_arg(from).path_arg(to)
    }

    pub fn rm_bg(&self, dir: &Path) -> Invocation {
        self.invocation("rm").arg("--bg").path_arg(dir)
    }

    pub fn run(&self, spec: &RunSpec<'_>) -> Result<Invocation, RunnerError> {
        let mut inv = self
            .invocation("run")
            .arg(format!("-p{}", spec.pidfile.display()))
            .arg(format!(
                "-P{} $${}",
                spec.runat,
                if spec.input_fifo.is_some() { " -i" } else { "" }
            ));
        if let Some(timing) = spec.timing_file {
            inv = inv.arg(format!("-t{}", timing.display()));
        }

        let binddir = match (spec.skeleton, spec.binddir) {
            (Some(skel), Some(bind)) if skel.join("proc").is_dir() => Some(bind),
            _ => None,
        };
        let homedir = match (spec.skeleton, binddir, spec.jailfiles) {
            (Some(skel), Some(bind), jailfiles) => {
                let mut contents = format!("/ <- {} [bind-ro", skel.display());
                if let Some((hash, files)) = jailfiles.and_then(|f| jailfiles_digest(f).map(|h| (h, f))) {
                    contents.push_str(&format!(" {hash} {}", files.display()));
                }
                contents.push_str(&format!(
                    "]\n{} <- {} [bind]",
                    spec.userhome,
                    spec.jailhome.display()
                ));
                inv = inv
                    .arg(format!("-u{}", spec.jailhome.display()))
                    .arg(format!("-F{contents}"));
                trim_trailing_slashes(bind)
            }
            (skel, _, Some(files)) => {
                inv = inv.arg("-h").arg(format!("-f{}", files.display()));
                if let Some(skel) = skel {
                    inv = inv.arg(format!("-S{}", skel.display()));
                }
                spec.jaildir.to_path_buf()
            }
            _ => return Err(RunnerError::config("Missing jail population configuration")),
        };

        if !spec.manifest.is_empty() {
            inv = inv.arg(format!("-F{}", spec.manifest.join("\n")));
        }
        if let Some(t) = spec.timeout {
            inv = inv.arg(format!("-T{t}"));
        }
        if let Some(t) = spec.idle_timeout {
            inv = inv.arg(format!("-I{t}"));
        }
        let rows = spec.rows.filter(|r| *r > 0);
        let columns = spec.columns.filter(|c| *c > 0);
        if rows.is_some() || columns.is_some() {
            inv = inv.arg(format!(
                "--size={}x{}",
                columns.unwrap_or(80),
                rows.unwrap_or(25)
            ));
        }
        if let Some(fifo) = spec.input_fifo {
            inv = inv.arg(format!("-i{}", fifo.display()));
        }
        Ok(inv
            .path_arg(&homedir)
            .arg(spec.username)
            .arg("TERM=xterm-256color")
            .arg(spec.command.clone()))
    }
}

/// Everything `run` needs besides the helper path.
#[derive(Debug, Clone)]
pub struct RunSpec<'a> {
    pub pidfile: &'a Path,
    pub runat: i64,
    pub input_fifo: Option<&'a Path>,
    pub timing_file: Option<&'a Path>,
    pub skeleton: Option<&'a Path>,
    pub binddir: Option<&'a Path>,
    pub jailfiles: Option<&'a Path>,
    pub manifest: &'a [String],
    pub timeout: Option<u64>,
    pub idle_timeout: Option<u64>,
    pub rows: Option<u16>,
    pub columns: Option<u16>,
    pub jaildir: &'a Path,
    pub jailhome: &'a Path,
    /// Home directory of the run-as user as seen inside the jail.
    pub userhome: &'a str,
    pub username: &'a str,
    pub command: String,
}

/// Hex SHA-256 of a jail file list, skipped for paths the manifest syntax
/// cannot carry.
fn jailfiles_digest(path: &Path) -> Option<String> {
    let text = path.to_str()?;
    if text.chars().any(|c| c.is_whitespace() || c == ']' || c == ';') {
        return None;
    }
    let bytes = std::fs::read(path).ok()?;
    Some(hex::encode(Sha256::digest(&bytes)))
}

fn trim_trailing_slashes(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    let trimmed = text.trim_end_matches('/');
    if trimmed.is_empty() {
        PathBuf::from("/")
    } else {
        PathBuf::from(trimmed)
    }
}

/// Move any existing jail at `jaildir` aside and delete it in the
/// background, retrying with back-off while the directory persists.
pub fn remove_old_jails(
    cl: &mut CommandLog<'_>,
    helper: &JailHelper,
    jaildir: &Path,
    now: i64,
) -> Result<(), RunnerError> {
    let stamp = DateTime::from_timestamp(now, 0)
        .map(|t| t.format("%Y%m%dT%H%M%S").to_string())
        .unwrap_or_else(|| now.to_string());
    let prefix = format!("{}~.{stamp}", jaildir.display());
    let mut tries = 0u32;
    while jaildir.is_dir() {
        if tries > MAX_REMOVE_TRIES {
            return Err(RunnerError::env("Can't remove old jail"));
        }
        if tries > 0 {
            std::thread::sleep(Duration::from_millis(100 * (1u64 << tries.min(4))));
        }
        let newdir = if tries > 0 {
            PathBuf::from(format!("{prefix}.{tries}"))
        } else {
            PathBuf::from(&prefix)
        };
        if cl.run(&helper.mv(jaildir, &newdir))? != 0 {
            return Err(RunnerError::env("Can't remove old jail"));
        }
        cl.run(&helper.rm_bg(&newdir))?;
        tries += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec<'a>(jaildir: &'a Path, jailhome: &'a Path) -> RunSpec<'a> {
        RunSpec {
            pidfile: Path::new("/log/repo1.pset2.pid"),
            runat: 1700,
            input_fifo: None,
            timing_file: None,
            skeleton: None,
            binddir: None,
            jailfiles: None,
            manifest: &[],
            timeout: None,
            idle_timeout: None,
            rows: None,
            columns: None,
            jaildir,
            jailhome,
            userhome: "/home/jail61",
            username: "jail61user",
            command: "make check".into(),
        }
    }

    #[test]
    fn run_without_population_is_a_config_error() {
        let helper = JailHelper::new("/x/pa-jail");
        let s = spec(Path::new("/jails/1"), Path::new("/jails/1/home/jail61"));
        let err = helper.run(&s).unwrap_err();
        assert_eq!(err.to_string(), "Missing jail population configuration");
    }

    #[test]
    fn run_with_jail_files() {
        let helper = JailHelper::new("/x/pa-jail");
        let mut s = spec(Path::new("/jails/1"), Path::new("/jails/1/home/jail61"));
        let manifest = vec!["/usr/bin/make".to_string(), "/bin/sh".to_string()];
        s.jailfiles = Some(Path::new("/conf/jfiles"));
        s.skeleton = Some(Path::new("/skel"));
        s.input_fifo = Some(Path::new("/log/repo1.pset2.1700.in"));
        s.manifest = &manifest;
        s.timeout = Some(30);
        s.rows = Some(40);
        let inv = helper.run(&s).unwrap();
        assert_eq!(
            inv.args,
            vec![
                "run",
                "-p/log/repo1.pset2.pid",
                "-P1700 $$ -i",
                "-h",
                "-f/conf/jfiles",
                "-S/skel",
                "-F/usr/bin/make\n/bin/sh",
                "-T30",
                "--size=80x40",
                "-i/log/repo1.pset2.1700.in",
                "/jails/1",
                "jail61user",
                "TERM=xterm-256color",
                "make check",
            ]
        );
    }

    #[test]
    fn run_with_skeleton_bind() {
        let tmp = tempfile::tempdir().unwrap();
        let skel = tmp.path().join("skel");
        std::fs::create_dir_all(skel.join("proc")).unwrap();
        let files = tmp.path().join("jfiles");
        std::fs::write(&files, "/bin/sh\n").unwrap();
        let helper = JailHelper::new("/x/pa-jail");
        let mut s = spec(Path::new("/jails/1"), Path::new("/jails/1/home/jail61"));
        s.skeleton = Some(&skel);
        s.binddir = Some(Path::new("/bind//"));
        s.jailfiles = Some(&files);
        let inv = helper.run(&s).unwrap();
        let digest = hex::encode(Sha256::digest(b"/bin/sh\n"));
        let manifest = format!(
            "-F/ <- {} [bind-ro {digest} {}]\n/home/jail61 <- /jails/1/home/jail61 [bind]",
            skel.display(),
            files.display()
        );
        assert_eq!(inv.args[2], "-P1700 $$");
        assert_eq!(inv.args[3], "-u/jails/1/home/jail61");
        assert_eq!(inv.args[4], manifest);
        assert_eq!(inv.args[5], "/bind");
    }

    #[test]
    fn bind_dir_ignored_without_proc_in_skeleton() {
        let tmp = tempfile::tempdir().unwrap();
        let helper = JailHelper::new("/x/pa-jail");
        let mut s = spec(Path::new("/jails/1"), Path::new("/jails/1/home/jail61"));
        s.skeleton = Some(tmp.path());
        s.binddir = Some(Path::new("/bind"));
        assert!(helper.run(&s).is_err());
    }

    #[test]
    fn helper_check_requires_executable() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pa-jail");
        assert!(JailHelper::new(&path).check().is_err());
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert!(JailHelper::new(&path).check().is_err());
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        assert!(JailHelper::new(&path).check().is_ok());
    }
}
