use std::sync::LazyLock;

use regex::Regex;

use crate::error::{ManifestProblem, RegistryError};

static REPOSITORY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*$")
        .expect("repository pattern is valid")
});

static TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").expect("tag pattern is valid")
});

pub const DEFAULT_PROJECT: &str = "library";

pub fn validate_repository(name: &str) -> Result<(), RegistryError> {
    if name.len() <= 255 && REPOSITORY.is_match(name) {
        Ok(())
    } else {
        Err(RegistryError::ManifestInvalid(ManifestProblem::InvalidName(
            name.to_string(),
        )))
    }
}

pub fn validate_tag(tag: &str) -> Result<(), RegistryError> {
    if TAG.is_match(tag) {
        Ok(())
    } else {
        Err(RegistryError::ManifestInvalid(ManifestProblem::InvalidTag(
            tag.to_string(),
        )))
    }
}

/// The project that owns a repository, and is charged for its storage.
pub fn project_of(repository: &str) -> &str {
    match repository.split_once('/') {
        Some((project, _)) => project,
        None => DEFAULT_PROJECT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repositories() {
        for name in ["foo", "foo/bar", "a/b/c", "my-app", "my__app", "a.b/c_d"] {
            assert!(validate_repository(name).is_ok(), "{name}");
        }
        for name in ["", "Foo", "foo/", "/foo", "foo//bar", "-foo", "foo/../bar"] {
            assert!(validate_repository(name).is_err(), "{name}");
        }
    }

    #[test]
    fn tags() {
        assert!(validate_tag("latest").is_ok());
        assert!(validate_tag("v1.2.3-rc_1").is_ok());
        assert!(validate_tag(".hidden").is_err());
        assert!(validate_tag(&"a".repeat(129)).is_err());
    }

    #[test]
    fn projects() {
        assert_eq!(project_of("team/app"), "team");
        assert_eq!(project_of("team/app/sub"), "team");
        assert_eq!(project_of("app"), "library");
    }
}
