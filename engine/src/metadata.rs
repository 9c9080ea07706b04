//! Parsing of the metadata docstring that every pack starts with:
//!
//! ```text
//! /**
//!  * @name full_name
//!  * @version 1.0.0
//!  * @description Splits "Last, First" names.
//!  */
//! ```
//!
//! `@name` and `@version` are required. `@description` may continue over following lines until the
//! next tag. Unknown tags are ignored.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PackMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum MetadataError {
    #[error("pack code must start with a /** ... */ metadata docstring")]
    MissingDocstring,
    #[error("metadata docstring is not terminated by */")]
    Unterminated,
    #[error("metadata docstring has no @{0} tag")]
    MissingTag(&'static str),
    #[error("metadata tag @{tag} is given more than once")]
    DuplicateTag { tag: String },
    #[error("metadata tag @{tag} must be a single word, got {value:?}")]
    NotAWord { tag: &'static str, value: String },
}

/// Parses the metadata docstring at the start of `code`.
pub fn parse_metadata(code: &str) -> Result<PackMetadata, MetadataError> {
    let body = code
        .trim_start()
        .strip_prefix("/**")
        .ok_or(MetadataError::MissingDocstring)?;
    let end = body.find("*/").ok_or(MetadataError::Unterminated)?;

    let mut name: Option<String> = None;
    let mut version: Option<String> = None;
    let mut description: Option<String> = None;
    // Tag that untagged lines continue.
    let mut continuing: Option<&str> = None;

    for line in body[..end].lines() {
        let line = strip_line_decoration(line);
        match lazy_regex::regex_captures!(r"^@([A-Za-z_]+)\s*(.*)$", line) {
            Some((_, tag, value)) => {
                let value = value.trim();
                let slot = match tag {
                    "name" => &mut name,
                    "version" => &mut version,
                    "description" => &mut description,
                    _ => {
                        continuing = None;
                        continue;
                    }
                };
                if slot.is_some() {
                    return Err(MetadataError::DuplicateTag {
                        tag: tag.to_string(),
                    });
                }
                *slot = Some(value.to_string());
                continuing = Some(tag);
            }
            None => {
                if line.is_empty() || continuing != Some("description") {
                    continue;
                }
                if let Some(description) = description.as_mut() {
                    if !description.is_empty() {
                        description.push(' ');
                    }
                    description.push_str(line);
                }
            }
        }
    }

    Ok(PackMetadata {
        name: single_word("name", name)?,
        version: single_word("version", version)?,
        description: description.filter(|d| !d.is_empty()),
    })
}

/// Removes leading whitespace and the conventional leading `*` from a docstring line.
fn strip_line_decoration(line: &str) -> &str {
    let line = line.trim();
    match line.strip_prefix('*') {
        Some(rest) => rest.trim(),
        None => line,
    }
}

fn single_word(tag: &'static str, value: Option<String>) -> Result<String, MetadataError> {
    match value {
        None => Err(MetadataError::MissingTag(tag)),
        Some(value) if value.is_empty() => Err(MetadataError::MissingTag(tag)),
        Some(value) if value.contains(char::is_whitespace) => {
            Err(MetadataError::NotAWord { tag, value })
        }
        Some(value) => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use test_casing::{TestCases, cases, test_casing};

    use super::*;

    #[gtest]
    fn test_parse_full_docstring() {
        let code = r#"
            /**
             * @name full_name
             * @version 1.2.0
             * @author someone
             * @description Splits "Last, First" names
             *   into their parts.
             */
            function detect_comma(input) { return {}; }
        "#;

        expect_that!(
            parse_metadata(code),
            ok(eq(&PackMetadata {
                name: "full_name".to_string(),
                version: "1.2.0".to_string(),
                description: Some("Splits \"Last, First\" names into their parts.".to_string()),
            }))
        );
    }

    #[gtest]
    fn test_parse_single_line_docstring() {
        expect_that!(
            parse_metadata("/** @name email @version 2 */"),
            err(eq(&MetadataError::NotAWord {
                tag: "name",
                value: "email @version 2".to_string(),
            }))
        );
        expect_that!(
            parse_metadata("/**\n@name email\n@version 2 */\n"),
            ok(eq(&PackMetadata {
                name: "email".to_string(),
                version: "2".to_string(),
                description: None,
            }))
        );
    }

    const INVALID_CASES: TestCases<(&'static str, MetadataError)> = cases! {
        [
            ("function detect_x() {}", MetadataError::MissingDocstring),
            ("// @name x\n", MetadataError::MissingDocstring),
            ("/** @name x\n@version 1\n", MetadataError::Unterminated),
            ("/**\n * @version 1\n */", MetadataError::MissingTag("name")),
            ("/**\n * @name x\n */", MetadataError::MissingTag("version")),
            ("/**\n * @name\n * @version 1\n */", MetadataError::MissingTag("name")),
        ]
    };

    #[test]
    fn test_invalid_cases_len() {
        assert_eq!(6, INVALID_CASES.into_iter().count());
    }

    #[test_casing(6, INVALID_CASES)]
    #[gtest]
    fn test_parse_invalid(code: &'static str, expected: MetadataError) {
        expect_that!(parse_metadata(code), err(eq(&expected)));
    }

    #[gtest]
    fn test_duplicate_tag() {
        expect_that!(
            parse_metadata("/**\n * @name a\n * @name b\n * @version 1\n */"),
            err(eq(&MetadataError::DuplicateTag {
                tag: "name".to_string()
            }))
        );
    }
}
