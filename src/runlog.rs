//! Physical layout of run logs, pid files, and input pipes.
//!
//! One directory per (repository cache, pset):
//!
//! ```text
//! <log_root>/run<cacheid>.pset<psetid>/
//!     repo<repoid>.pset<psetid>.pid             pid file of the active run
//!     repo<repoid>.pset<psetid>.<runat>.log     output of run <runat>
//!     repo<repoid>.pset<psetid>.<runat>.log.time  timing for replay
//!     repo<repoid>.pset<psetid>.<runat>.in      input FIFO
//! ```
//!
//! A run is live while some process holds an exclusive `flock` on the pid
//! file. The jail helper takes that lock when it launches the command and
//! keeps it until the command exits.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::schema::RunResponse;

/// Largest chunk returned by a single [`RunLogger::job_response`] call.
pub const MAX_RESPONSE_CHUNK: u64 = 1 << 20;

const HEADER_PREFIX: &str = "++ {";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLogger {
    dir: PathBuf,
    stem: String,
}

impl RunLogger {
    pub fn new(log_root: &Path, cacheid: &str, repoid: i64, psetid: i64) -> Self {
        Self {
            dir: log_root.join(format!("run{cacheid}.pset{psetid}")),
            stem: format!("repo{repoid}.pset{psetid}"),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_log_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{suffix}", self.stem))
    }

    pub fn pid_file(&self) -> PathBuf {
        self.file(".pid")
    }

    pub fn output_file(&self, runat: i64) -> PathBuf {
        self.file(&format!(".{runat}.log"))
    }

    pub fn timing_file(&self, runat: i64) -> PathBuf {
        self.file(&format!(".{runat}.log.time"))
    }

    pub fn input_fifo(&self, runat: i64) -> PathBuf {
        self.file(&format!(".{runat}.in"))
    }

    pub fn active_job(&self) -> Option<i64> {
        active_job_at(&self.pid_file())
    }

    /// The `++ {json}` header of run `runat`'s log, if well formed.
    pub fn job_info(&self, runat: i64) -> Option<RunResponse> {
        let mut head = Vec::with_capacity(4096);
        File::open(self.output_file(runat))
            .ok()?
            .take(4096)
            .read_to_end(&mut head)
            .ok()?;
        let head = String::from_utf8_lossy(&head);
        let line = head.strip_prefix("++ ")?.split('\n').next()?;
        if !head.starts_with(HEADER_PREFIX) || !head.contains('\n') {
            return None;
        }
        serde_json::from_str(line).ok()
    }

    /// Output of run `runat` starting at byte `offset` of the body (the
    /// header line is not part of the body).
    pub fn job_response(&self, runat: i64, offset: u64) -> RunResponse {
        let path = self.output_file(runat);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(_) => return RunResponse::failure("No such log"),
        };
        let mut rr = self.job_info(runat).unwrap_or_default();
        rr.ok = Some(true);
        rr.timestamp = runat;
        match read_body(&mut file, offset) {
            Ok((data, more)) => {
                rr.offset = Some(offset);
                rr.lastoffset = Some(offset + data.len() as u64);
                rr.data = Some(String::from_utf8_lossy(&data).into_owned());
                if more {
                    rr.partial = Some(true);
                }
            }
            Err(e) => return RunResponse::failure(format!("Can't read log: {e}")),
        }
        let done = self.active_job() != Some(runat);
        rr.done = Some(done);
        rr
    }

    /// Send bytes to a live run's input FIFO without blocking.
    pub fn job_write(&self, runat: i64, data: &[u8]) -> io::Result<()> {
        let mut options = OpenOptions::new();
        options.write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(nix::fcntl::OFlag::O_NONBLOCK.bits());
        }
        let mut fifo = options.open(self.input_fifo(runat))?;
        fifo.write_all(data)
    }

    /// Open the log of `runat` for appending provisioning output.
    pub fn open_log(&self, runat: i64) -> io::Result<RunLog> {
        let path = self.output_file(runat);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(RunLog { path, file })
    }
}

fn read_body(file: &mut File, offset: u64) -> io::Result<(Vec<u8>, bool)> {
    let mut all = Vec::new();
    let mut head = [0u8; 4];
    let n = file.read(&mut head)?;
    let mut body_start = 0u64;
    if n == 4 && &head == b"++ {" {
        file.seek(SeekFrom::Start(0))?;
        let mut reader = io::BufReader::new(&mut *file);
        let mut line = Vec::new();
        io::BufRead::read_until(&mut reader, b'\n', &mut line)?;
        body_start = line.len() as u64;
    }
    let len = file.metadata()?.len();
    let Some(start) = body_start.checked_add(offset).filter(|start| *start < len) else {
        return Ok((all, false));
    };
    file.seek(SeekFrom::Start(start))?;
    file.take(MAX_RESPONSE_CHUNK + 1).read_to_end(&mut all)?;
    let more = all.len() as u64 > MAX_RESPONSE_CHUNK;
    all.truncate(MAX_RESPONSE_CHUNK as usize);
    Ok((all, more))
}

/// Append handle on one run's log.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    file: File,
}

impl RunLog {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_header(&mut self, info: &RunResponse) -> io::Result<()> {
        let json = serde_json::to_string(info).map_err(io::Error::other)?;
        writeln!(self.file, "++ {json}")
    }

    /// Record a provisioning command as `++ <argv>`.
    pub fn command(&mut self, argv: &str) -> io::Result<()> {
        writeln!(self.file, "++ {argv}")
    }

    pub fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Inspect a pid file. Returns the live run id, `Some(1)` when live but
/// unparseable, `None` when no run holds it. A dead pid file is removed
/// together with the run's input FIFO.
pub fn active_job_at(path: &Path) -> Option<i64> {
    let mut file = File::open(path).ok()?;
    let mut contents = String::new();
    if file.read_to_string(&mut contents).is_err() {
        return Some(1);
    }
    let runat = contents
        .split_whitespace()
        .next()
        .filter(|w| w.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|w| w.parse::<i64>().ok())
        .filter(|r| *r > 0);

    if lock_is_free(file) {
        if let (Some(runat), Some(stem)) = (runat, path.to_str().and_then(|p| p.strip_suffix(".pid"))) {
            if contents.contains("-i") {
                let _ = fs::remove_file(format!("{stem}.{runat}.in"));
            }
        }
        let _ = fs::remove_file(path);
        None
    } else {
        Some(runat.unwrap_or(1))
    }
}

#[cfg(unix)]
fn lock_is_free(file: File) -> bool {
    use nix::fcntl::{Flock, FlockArg};
    match Flock::lock(file, FlockArg::LockSharedNonblock) {
        Ok(lock) => {
            drop(lock);
            true
        }
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn lock_is_free(_file: File) -> bool {
    true
}

#[cfg(unix)]
pub(crate) fn make_fifo(path: &Path) -> io::Result<()> {
    use nix::sys::stat::Mode;
    let _ = fs::remove_file(path);
    nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o660)).map_err(io::Error::from)
}

#[cfg(not(unix))]
pub(crate) fn make_fifo(_path: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "named pipes need unix"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger(dir: &Path) -> RunLogger {
        let rl = RunLogger::new(dir, "7", 7, 3);
        rl.ensure_log_dir().unwrap();
        rl
    }

    #[test]
    fn file_layout() {
        let rl = RunLogger::new(Path::new("/l"), "c9", 7, 3);
        assert_eq!(rl.pid_file(), PathBuf::from("/l/runc9.pset3/repo7.pset3.pid"));
        assert_eq!(rl.output_file(5), PathBuf::from("/l/runc9.pset3/repo7.pset3.5.log"));
        assert_eq!(rl.timing_file(5), PathBuf::from("/l/runc9.pset3/repo7.pset3.5.log.time"));
        assert_eq!(rl.input_fifo(5), PathBuf::from("/l/runc9.pset3/repo7.pset3.5.in"));
    }

    #[test]
    fn unlocked_pid_file_is_dead_and_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let rl = logger(tmp.path());
        fs::write(rl.pid_file(), "100 4242 -i\n").unwrap();
        fs::write(rl.input_fifo(100), "").unwrap();
        assert_eq!(rl.active_job(), None);
        assert!(!rl.pid_file().exists());
        assert!(!rl.input_fifo(100).exists());
        assert_eq!(rl.active_job(), None);
    }

    #[cfg(unix)]
    #[test]
    fn locked_pid_file_reports_run() {
        use nix::fcntl::{Flock, FlockArg};
        let tmp = tempfile::tempdir().unwrap();
        let rl = logger(tmp.path());
        fs::write(rl.pid_file(), "100\n").unwrap();
        let f = File::open(rl.pid_file()).unwrap();
        let _held = Flock::lock(f, FlockArg::LockExclusiveNonblock).unwrap();
        assert_eq!(rl.active_job(), Some(100));

        fs::write(rl.pid_file(), "garbage\n").unwrap();
        assert_eq!(rl.active_job(), Some(1));
    }

    #[test]
    fn response_skips_header_and_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let rl = logger(tmp.path());
        let mut log = rl.open_log(100).unwrap();
        log.write_header(&RunResponse {
            runner: "make".into(),
            timestamp: 100,
            tags: Some(vec!["final".into()]),
            ..Default::default()
        })
        .unwrap();
        log.append(b"hello\nworld\n").unwrap();

        let info = rl.job_info(100).unwrap();
        assert_eq!(info.runner, "make");
        assert!(info.has_tag("final"));

        let rr = rl.job_response(100, 0);
        assert_eq!(rr.data.as_deref(), Some("hello\nworld\n"));
        assert_eq!(rr.done, Some(true));
        assert_eq!(rr.partial, None);
        let rr = rl.job_response(100, 6);
        assert_eq!(rr.data.as_deref(), Some("world\n"));
        assert_eq!(rr.lastoffset, Some(12));

        for offset in [12, 4096, u64::MAX - 3, u64::MAX] {
            let rr = rl.job_response(100, offset);
            assert_eq!(rr.ok, Some(true), "offset {offset}");
            assert_eq!(rr.data.as_deref(), Some(""));
            assert_eq!(rr.lastoffset, Some(offset));
        }
    }

    #[test]
    fn missing_log_is_a_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let rr = logger(tmp.path()).job_response(5, 0);
        assert_eq!(rr.error, Some(true));
        assert_eq!(rr.message.as_deref(), Some("No such log"));
    }
}
