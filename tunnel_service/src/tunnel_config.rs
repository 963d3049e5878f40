//! Tunnel configuration blobs and the parser seam that validates them.
//!
//! The service never interprets a configuration beyond checking that it is
//! well formed; the dataplane is the only consumer of its contents.

use shared_utils::keys::{self, KeyError};
use thiserror::Error;

/// Errors produced while validating configuration text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigParseError {
    #[error("configuration is empty")]
    Empty,

    #[error("configuration has no [Interface] section")]
    MissingInterface,

    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("invalid PrivateKey: {0}")]
    InvalidKey(#[from] KeyError),
}

/// Opaque, validated tunnel configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    text: String,
    private_key: Option<String>,
}

impl TunnelConfig {
    /// Configuration of a tunnel adopted at start-up whose text is unknown.
    pub fn unknown() -> Self {
        Self {
            text: String::new(),
            private_key: None,
        }
    }

    /// The configuration text as submitted.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Base64 public key derived from the interface private key, if any.
    pub fn public_key(&self) -> Option<String> {
        self.private_key
            .as_deref()
            .and_then(|key| keys::public_key_from_base64(key).ok())
    }
}

/// Turns configuration text into a [`TunnelConfig`].
pub trait ConfigParser: Send + Sync {
    fn parse(&self, text: &str) -> Result<TunnelConfig, ConfigParseError>;
}

/// Validates the INI-style dialect: `[Section]` headers followed by
/// `Key = Value` lines, `#` comments, and a mandatory `[Interface]` section.
#[derive(Debug, Default, Clone, Copy)]
pub struct IniConfigParser;

impl ConfigParser for IniConfigParser {
    fn parse(&self, text: &str) -> Result<TunnelConfig, ConfigParseError> {
        if text.trim().is_empty() {
            return Err(ConfigParseError::Empty);
        }

        let mut section: Option<String> = None;
        let mut has_interface = false;
        let mut private_key = None;

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }

            if let Some(header) = line.strip_prefix('[') {
                let name = header.strip_suffix(']').ok_or(ConfigParseError::Syntax {
                    line: line_no,
                    message: "unterminated section header".to_string(),
                })?;
                let name = name.trim();
                if name.is_empty() {
                    return Err(ConfigParseError::Syntax {
                        line: line_no,
                        message: "empty section name".to_string(),
                    });
                }
                has_interface |= name.eq_ignore_ascii_case("interface");
                section = Some(name.to_string());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigParseError::Syntax {
                    line: line_no,
                    message: "expected 'Key = Value'".to_string(),
                });
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigParseError::Syntax {
                    line: line_no,
                    message: "missing key".to_string(),
                });
            }
            let Some(current) = section.as_deref() else {
                return Err(ConfigParseError::Syntax {
                    line: line_no,
                    message: format!("'{key}' appears before any section"),
                });
            };

            if current.eq_ignore_ascii_case("interface") && key.eq_ignore_ascii_case("privatekey")
            {
                let value = value.trim();
                keys::decode_key(value)?;
                private_key = Some(value.to_string());
            }
        }

        if !has_interface {
            return Err(ConfigParseError::MissingInterface);
        }

        Ok(TunnelConfig {
            text: text.to_string(),
            private_key,
        })
    }
}
