//! Export of run settings into the jail as `config.sh` and `config.mk`.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

use crate::error::RunnerError;
use crate::schema::RunSettings;

/// Which setting names may reach the sandboxed process. Versioned so a
/// change to the deny list is an explicit, reviewable step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportPolicy {
    #[default]
    V1,
}

fn deny_v1() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\A(?:PATH|MAKE|HOME|SHELL|POSIXLY_CORRECT|TMPDIR|LANG|USER|LOGNAME|SSH.*|PS\d|HISTFILE|LD_LIBRARY_PATH|HOST|HOSTNAME|TERM|TERMCAP|EDITOR|PAGER|MANPATH)\z",
        )
        .expect("static regex")
    })
}

fn make_safe() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\A[-A-Za-z0-9_:/ .,]*\z").expect("static regex"))
}

impl ExportPolicy {
    pub fn allows(self, name: &str) -> bool {
        match self {
            ExportPolicy::V1 => RunSettings::valid_name(name) && !deny_v1().is_match(name),
        }
    }

    /// `(config.sh, config.mk)` contents. Values that make syntax cannot
    /// carry are left out of the make form only.
    pub fn render(self, settings: &RunSettings) -> (String, String) {
        let mut sh = String::new();
        let mut mk = String::new();
        for (name, value) in settings.iter().filter(|(name, _)| self.allows(name)) {
            if make_safe().is_match(value) {
                mk.push_str(&format!("{name} = {value}\n"));
            }
            sh.push_str(&format!("{name}={}\n", sh_quote(value)));
        }
        (sh, mk)
    }

    pub fn write_files(self, jailhome: &Path, settings: &RunSettings) -> Result<(), RunnerError> {
        let (sh, mk) = self.render(settings);
        std::fs::write(jailhome.join("config.mk"), mk)?;
        std::fs::write(jailhome.join("config.sh"), sh)?;
        Ok(())
    }
}

/// Always single-quoted, so an empty value still assigns.
fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}
