//! On-disk form of the registry: one `{name}.graphql` blob per service whose
//! first line records the endpoint, followed by a blank line and the SDL.
//!
//! ```text
//! # $url http://accounts:4001/graphql
//!
//! type Query { me: User }
//! ```

use serde::{Deserialize, Serialize};

use crate::{ServiceDescriptor, error::RegistryError};

const URL_HEADER: &str = "# $url ";
const FILE_EXTENSION: &str = ".graphql";

/// A file to be written into a git tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryFile {
    pub path: String,
    #[serde(rename = "content")]
    pub contents: String,
    pub mode: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl RegistryFile {
    pub fn blob(path: String, contents: String) -> Self {
        RegistryFile {
            path,
            contents,
            mode: "100644".to_string(),
            kind: "blob".to_string(),
        }
    }
}

/// Collapses whitespace runs into single hyphens, dropping leading and
/// trailing whitespace, so a release name becomes a valid branch name.
pub fn slugify(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join("-")
}

pub fn file_path(registry_path: &str, name: &str) -> String {
    format!(
        "{}/{}{}",
        registry_path.trim_end_matches('/'),
        name,
        FILE_EXTENSION
    )
}

pub fn encode(url: &str, sdl: &str) -> String {
    format!("{URL_HEADER}{url}\n\n{sdl}")
}

/// Recovers `(url, sdl)` from a registry blob. `file` is only used to name
/// the offending entry when the header is missing.
pub fn decode(file: &str, text: &str) -> Result<(String, String), RegistryError> {
    let malformed = || RegistryError::MalformedRegistryEntry {
        file: file.to_string(),
    };

    let rest = text.strip_prefix(URL_HEADER).ok_or_else(malformed)?;
    let (url, body) = rest.split_once('\n').ok_or_else(malformed)?;
    let url = url.trim_end_matches('\r').trim();
    if url.is_empty() {
        return Err(malformed());
    }

    let sdl = body
        .strip_prefix("\r\n")
        .or_else(|| body.strip_prefix('\n'))
        .unwrap_or(body);

    Ok((url.to_string(), sdl.to_string()))
}

/// Builds a descriptor from a tree entry name (`catalog.graphql`) and its text.
pub fn decode_entry(entry_name: &str, text: &str) -> Result<ServiceDescriptor, RegistryError> {
    let name = entry_name
        .strip_suffix(FILE_EXTENSION)
        .unwrap_or(entry_name)
        .to_string();
    let (url, sdl) = decode(entry_name, text)?;
    Ok(ServiceDescriptor { name, url, sdl })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("spring release", "spring-release")]
    #[case("  spring \t\n release  2 ", "spring-release-2")]
    #[case("already-slugged", "already-slugged")]
    #[case("", "")]
    #[case("   ", "")]
    fn slugify_collapses_whitespace(#[case] input: &str, #[case] expected: &str) {
        let slug = slugify(input);
        assert_eq!(slug, expected);
        assert_eq!(slugify(&slug), slug);
        assert!(!slug.starts_with('-') && !slug.ends_with('-'));
    }

    #[rstest]
    #[case("http://x/graphql", "type Query { ok: Boolean }")]
    #[case("https://accounts.internal:4001/graphql", "type Query {\n  me: User\n}\n\ntype User { id: ID! }\n")]
    #[case("http://x/graphql", "\n# leading blank line and a comment\ntype Query { a: Int }")]
    #[case("http://x/graphql", "")]
    fn decode_inverts_encode(#[case] url: &str, #[case] sdl: &str) {
        let text = encode(url, sdl);
        assert_eq!(decode("svc.graphql", &text).unwrap(), (url.to_string(), sdl.to_string()));
    }

    #[test]
    fn decodes_registry_entry() {
        let service = decode_entry(
            "catalog.graphql",
            "# $url http://x/graphql\n\ntype Query { ok: Boolean }",
        )
        .unwrap();

        assert_eq!(
            service,
            ServiceDescriptor {
                name: "catalog".to_string(),
                url: "http://x/graphql".to_string(),
                sdl: "type Query { ok: Boolean }".to_string(),
            }
        );
    }

    #[rstest]
    #[case("type Query { ok: Boolean }")]
    #[case("# $url \n\ntype Query { ok: Boolean }")]
    #[case("# $url http://x/graphql")]
    fn rejects_entries_without_header(#[case] text: &str) {
        let err = decode_entry("broken.graphql", text).unwrap_err();
        assert!(
            matches!(err, RegistryError::MalformedRegistryEntry { ref file } if file == "broken.graphql")
        );
    }

    #[test]
    fn builds_paths_under_registry_root() {
        assert_eq!(file_path("schemas", "catalog"), "schemas/catalog.graphql");
        assert_eq!(file_path("schemas/", "catalog"), "schemas/catalog.graphql");
    }
}
