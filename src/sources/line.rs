use crate::error::MigrateError;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    Passthrough,
    AlreadySigned,
    NeedsMigration,
}

/// A `deb`/`deb-src` line split into its pieces. Every byte of the input
/// is held by exactly one field, so reassembly is lossless.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLine<'a> {
    /// Leading whitespace plus the verb.
    head: &'a str,
    pub verb: &'a str,
    gap: &'a str,
    /// Inner text of the `[...]` block, if any.
    pub options: Option<&'a str>,
    /// Everything after the option block, or after `gap` when there is none.
    pub rest: &'a str,
}

impl<'a> SourceLine<'a> {
    /// `Ok(None)` for lines that are not repository entries.
    pub fn parse(text: &'a str) -> Result<Option<Self>, MigrateError> {
        let lead = text.len() - text.trim_start().len();
        let body = &text[lead..];
        let verb_len = body.find(char::is_whitespace).unwrap_or(body.len());
        let verb = &body[..verb_len];

        if verb != "deb" && verb != "deb-src" {
            return Ok(None);
        }

        let after_verb = &body[verb_len..];
        let gap_len = after_verb.len() - after_verb.trim_start().len();
        let gap = &after_verb[..gap_len];
        let remainder = &after_verb[gap_len..];

        let (options, rest) = match remainder.strip_prefix('[') {
            Some(bracketed) => {
                let close = bracketed.find(']').ok_or_else(|| MigrateError::Parse {
                    line: text.to_string(),
                })?;
                (Some(&bracketed[..close]), &bracketed[close + 1..])
            }
            None => (None, remainder),
        };

        Ok(Some(Self {
            head: &text[..lead + verb_len],
            verb,
            gap,
            options,
            rest,
        }))
    }

    pub fn is_signed(&self) -> bool {
        self.options
            .map(|inner| inner.to_ascii_lowercase().contains("signed-by"))
            .unwrap_or(false)
    }

    /// The `dists/<suite>/` root, or `<suite>` itself for flat repositories.
    pub fn metadata_url(&self) -> Result<String, MigrateError> {
        let mut fields = self.rest.split_whitespace();
        let (base, suite) = match (fields.next(), fields.next()) {
            (Some(base), Some(suite)) => (base, suite),
            _ => {
                return Err(MigrateError::Parse {
                    line: self.to_string(),
                })
            }
        };
        let base = base.strip_suffix('/').unwrap_or(base);

        if suite.ends_with('/') {
            Ok(format!("{}/{}", base, suite))
        } else {
            Ok(format!("{}/dists/{}/", base, suite))
        }
    }

    pub fn with_signed_by(&self, keyring: &Path) -> String {
        let signed_by = format!("signed-by={}", keyring.display());

        match self.options {
            Some(inner) if inner.trim().is_empty() => {
                format!("{}{}[{}]{}", self.head, self.gap, signed_by, self.rest)
            }
            Some(inner) => format!(
                "{}{}[{} {}]{}",
                self.head,
                self.gap,
                inner.trim_end(),
                signed_by,
                self.rest
            ),
            None => format!("{}{}[{}] {}", self.head, self.gap, signed_by, self.rest),
        }
    }
}

impl std::fmt::Display for SourceLine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.options {
            Some(inner) => write!(f, "{}{}[{}]{}", self.head, self.gap, inner, self.rest),
            None => write!(f, "{}{}{}", self.head, self.gap, self.rest),
        }
    }
}

pub fn classify(text: &str) -> LineClass {
    match SourceLine::parse(text) {
        Ok(None) => LineClass::Passthrough,
        Ok(Some(line)) if line.is_signed() => LineClass::AlreadySigned,
        _ => LineClass::NeedsMigration,
    }
}

pub fn metadata_url(text: &str) -> Result<String, MigrateError> {
    match SourceLine::parse(text)? {
        Some(line) => line.metadata_url(),
        None => Err(MigrateError::Parse {
            line: text.to_string(),
        }),
    }
}

pub fn add_signed_by(text: &str, keyring: &Path) -> Result<String, MigrateError> {
    match SourceLine::parse(text)? {
        Some(line) => Ok(line.with_signed_by(keyring)),
        None => Err(MigrateError::Parse {
            line: text.to_string(),
        }),
    }
}
