use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use figment::{
    Error, Metadata, Profile, Provider,
    value::{Dict, Map, Tag, Value},
};

/// Wraps a provider so that every `<key>_file: <path>` also yields
/// `<key>: <contents of path>`. Relative paths resolve against the directory
/// of the file the value came from.
pub struct RecursiveFileProvider<P> {
    inner: P,
}

impl<P> RecursiveFileProvider<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

impl<P: Provider> Provider for RecursiveFileProvider<P> {
    fn metadata(&self) -> Metadata {
        self.inner.metadata()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let base = self
            .inner
            .metadata()
            .source
            .as_ref()
            .and_then(|source| match source {
                figment::Source::File(path) => path.parent().map(Path::to_path_buf),
                _ => None,
            })
            .unwrap_or_else(|| PathBuf::from("."));

        self.inner
            .data()?
            .into_iter()
            .map(|(profile, dict)| Ok::<_, Error>((profile, expand_dict(&base, dict)?)))
            .collect()
    }

    fn profile(&self) -> Option<Profile> {
        self.inner.profile()
    }
}

fn expand_dict(base: &Path, dict: Dict) -> Result<Dict, Error> {
    let mut expanded = BTreeMap::new();

    for (key, value) in dict {
        let value = expand_value(base, value)?;

        if let Some(stem) = key.strip_suffix("_file")
            && let Value::String(_, path) = &value
        {
            let path = Path::new(path);
            let path = if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            };
            let contents = std::fs::read_to_string(&path)
                .map_err(|err| Error::from(format!("Failed to read {path:?}: {err}")))?;
            expanded.insert(
                stem.to_string(),
                Value::String(Tag::Default, contents.trim_end().to_string()),
            );
        }

        expanded.insert(key, value);
    }

    Ok(expanded)
}

fn expand_value(base: &Path, value: Value) -> Result<Value, Error> {
    match value {
        Value::Dict(tag, dict) => Ok(Value::Dict(tag, expand_dict(base, dict)?)),
        Value::Array(tag, values) => Ok(Value::Array(
            tag,
            values
                .into_iter()
                .map(|v| expand_value(base, v))
                .collect::<Result<_, _>>()?,
        )),
        other => Ok(other),
    }
}
