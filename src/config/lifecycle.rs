use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum StringMatch {
    Exact { exact: String },
    Starts { starts: String },
    Ends { ends: String },
}

fn escape_glob(input: &str) -> String {
    let mut out = String::new();
    for c in input.chars() {
        match c {
            '*' => out.push_str("[*]"),
            '?' => out.push_str("[?]"),
            '[' => out.push_str("[[]"),
            ']' => out.push_str("[]]"),
            _ => out.push(c),
        }
    }
    out
}

impl StringMatch {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Exact { exact } => value == exact,
            Self::Starts { starts } => value.starts_with(starts),
            Self::Ends { ends } => value.ends_with(ends),
        }
    }

    /// The same match as an SQLite `GLOB` pattern.
    pub fn to_sqlite_glob(&self) -> String {
        match self {
            Self::Exact { exact } => escape_glob(exact),
            Self::Starts { starts } => format!("{}*", escape_glob(starts)),
            Self::Ends { ends } => format!("*{}", escape_glob(ends)),
        }
    }
}

fn glob_or_any(matcher: &Option<StringMatch>) -> String {
    matcher
        .as_ref()
        .map(StringMatch::to_sqlite_glob)
        .unwrap_or_else(|| "*".to_string())
}

/// Which tags the garbage collector expires.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RetentionRule {
    Tag {
        #[serde(default)]
        repository: Option<StringMatch>,
        #[serde(default)]
        tag: Option<StringMatch>,
        /// Days since the tag last moved.
        older_than: u32,
    },
}

impl RetentionRule {
    pub fn repository_glob(&self) -> String {
        match self {
            Self::Tag { repository, .. } => glob_or_any(repository),
        }
    }

    pub fn tag_glob(&self) -> String {
        match self {
            Self::Tag { tag, .. } => glob_or_any(tag),
        }
    }

    pub fn max_age(&self) -> chrono::Duration {
        match self {
            Self::Tag { older_than, .. } => chrono::Duration::days(i64::from(*older_than)),
        }
    }
}
