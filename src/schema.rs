use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Environment overrides attached to a job. Names are checked when the map
/// is built, so anything stored here is a syntactically valid variable name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, serde_json::Value>")]
pub struct RunSettings(BTreeMap<String, String>);

fn setting_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\A[A-Za-z_][A-Za-z_0-9]*\z").expect("static regex"))
}

impl RunSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn valid_name(name: &str) -> bool {
        setting_name_re().is_match(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<(), String> {
        let name = name.into();
        if !Self::valid_name(&name) {
            return Err(format!("invalid setting name {name:?}"));
        }
        self.0.insert(name, value.into());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Decode the `runsettings` column. Anything that is not a JSON object
    /// decodes to `None`; scalar values are stringified.
    pub fn from_json(text: &str) -> Option<Self> {
        match serde_json::from_str::<serde_json::Value>(text).ok()? {
            serde_json::Value::Object(obj) => Self::try_from(obj.into_iter().collect::<BTreeMap<_, _>>()).ok(),
            _ => None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }
}

impl TryFrom<BTreeMap<String, serde_json::Value>> for RunSettings {
    type Error = String;

    fn try_from(map: BTreeMap<String, serde_json::Value>) -> Result<Self, Self::Error> {
        let mut settings = RunSettings::new();
        for (name, value) in map {
            let value = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => continue,
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Number(n) => n.to_string(),
                other => other.to_string(),
            };
            settings.insert(name, value)?;
        }
        Ok(settings)
    }
}

/// Coarse state reported to a client polling a job's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Done,
    Partial,
    Working,
    Old,
}

/// JSON response about one run. The same shape is written as the first
/// line of every run log (`++ {json}`), so a completed log can be turned
/// back into a response without the queue row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<bool>,
    pub repoid: i64,
    pub pset: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    pub runner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<RunSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queueid: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ResponseStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lastoffset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// Tags are stored space-delimited, so they must be non-empty and free of
/// whitespace.
pub fn valid_tag(tag: &str) -> bool {
    !tag.is_empty() && !tag.chars().any(char::is_whitespace)
}

impl RunResponse {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.as_ref().is_some_and(|tags| tags.iter().any(|t| t == tag))
    }

    pub fn is_done(&self) -> bool {
        self.done == Some(true)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: Some(false),
            error: Some(true),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Settings carried by the run, `None` when absent or empty.
    pub fn custom_settings(&self) -> Option<&RunSettings> {
        self.settings.as_ref().filter(|s| !s.is_empty())
    }
}
