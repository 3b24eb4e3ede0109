//! Client options: the dictionary that parametrizes a service request.
//!
//! Options are built from explicit `(key, value)` pairs and validated
//! against the closed set of keys the installation service understands.

use std::fmt;

use thiserror::Error;

use crate::message::{Dictionary, Message, MessageKind};

/// Errors raised while building client options.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionsError {
    /// The key is not a recognized client option.
    #[error("unrecognized client option: {0}")]
    UnknownKey(String),

    /// The value has the wrong shape for the key.
    #[error("client option {key} expects {expected}, got {actual}")]
    InvalidValue {
        key: &'static str,
        expected: &'static str,
        actual: MessageKind,
    },

    /// The value has the right shape but is not an accepted value.
    #[error("client option {key} does not accept {value:?}")]
    UnsupportedValue { key: &'static str, value: String },
}

/// Recognized client option keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionKey {
    ApplicationType,
    PackageType,
    ITunesMetadata,
    ApplicationSinf,
    ReturnAttributes,
    SkipUninstall,
    ArchiveType,
    BundleIds,
}

impl OptionKey {
    pub const ALL: [OptionKey; 8] = [
        Self::ApplicationType,
        Self::PackageType,
        Self::ITunesMetadata,
        Self::ApplicationSinf,
        Self::ReturnAttributes,
        Self::SkipUninstall,
        Self::ArchiveType,
        Self::BundleIds,
    ];

    /// Returns the wire name of the key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApplicationType => "ApplicationType",
            Self::PackageType => "PackageType",
            Self::ITunesMetadata => "iTunesMetadata",
            Self::ApplicationSinf => "ApplicationSINF",
            Self::ReturnAttributes => "ReturnAttributes",
            Self::SkipUninstall => "SkipUninstall",
            Self::ArchiveType => "ArchiveType",
            Self::BundleIds => "BundleIDs",
        }
    }

    /// Parses a wire name into a key.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == name)
    }

    fn expected(&self) -> &'static str {
        match self {
            Self::ApplicationType | Self::PackageType | Self::ArchiveType => "string",
            Self::ITunesMetadata | Self::ApplicationSinf => "binary",
            Self::ReturnAttributes | Self::BundleIds => "array of strings",
            Self::SkipUninstall => "boolean",
        }
    }

    /// Checks the value shape for this key, normalizing where a looser shape is accepted.
    fn validate(&self, value: Message) -> Result<Message, OptionsError> {
        let key = self.as_str();
        let invalid = |actual: MessageKind| OptionsError::InvalidValue {
            key,
            expected: self.expected(),
            actual,
        };

        match self {
            Self::ApplicationType => {
                let s = value.as_str().ok_or_else(|| invalid(value.kind()))?;
                ApplicationType::parse(s).ok_or_else(|| OptionsError::UnsupportedValue {
                    key,
                    value: s.to_string(),
                })?;
                Ok(value)
            }
            Self::ArchiveType => {
                let s = value.as_str().ok_or_else(|| invalid(value.kind()))?;
                ArchiveType::parse(s).ok_or_else(|| OptionsError::UnsupportedValue {
                    key,
                    value: s.to_string(),
                })?;
                Ok(value)
            }
            Self::PackageType => match value.as_str() {
                Some("") => Err(OptionsError::UnsupportedValue {
                    key,
                    value: String::new(),
                }),
                Some(_) => Ok(value),
                None => Err(invalid(value.kind())),
            },
            Self::ITunesMetadata | Self::ApplicationSinf => match value {
                Message::Binary(_) => Ok(value),
                other => Err(invalid(other.kind())),
            },
            Self::ReturnAttributes | Self::BundleIds => match &value {
                Message::Array(items) if items.iter().all(|i| i.as_str().is_some()) => Ok(value),
                other => Err(invalid(other.kind())),
            },
            // Older callers pass SkipUninstall as an integer flag.
            Self::SkipUninstall => match value {
                Message::Boolean(_) => Ok(value),
                Message::Integer(i) => Ok(Message::Boolean(i != 0)),
                other => Err(invalid(other.kind())),
            },
        }
    }
}

impl fmt::Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application type filter for browse requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplicationType {
    System,
    User,
    Internal,
    Any,
}

impl ApplicationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "System",
            Self::User => "User",
            Self::Internal => "Internal",
            Self::Any => "Any",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "System" => Some(Self::System),
            "User" => Some(Self::User),
            "Internal" => Some(Self::Internal),
            "Any" => Some(Self::Any),
            _ => None,
        }
    }
}

/// What an archive operation captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveType {
    ApplicationOnly,
    DocumentsOnly,
}

impl ArchiveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApplicationOnly => "ApplicationOnly",
            Self::DocumentsOnly => "DocumentsOnly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ApplicationOnly" => Some(Self::ApplicationOnly),
            "DocumentsOnly" => Some(Self::DocumentsOnly),
            _ => None,
        }
    }
}

/// A validated client options dictionary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientOptions {
    entries: Dictionary,
}

impl ClientOptions {
    /// Returns a builder for client options.
    pub fn builder() -> ClientOptionsBuilder {
        ClientOptionsBuilder::new()
    }

    pub fn get(&self, key: OptionKey) -> Option<&Message> {
        self.entries.get(key.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn as_dictionary(&self) -> &Dictionary {
        &self.entries
    }

    /// Returns the options as a dictionary message.
    pub fn to_message(&self) -> Message {
        Message::Dictionary(self.entries.clone())
    }

    /// Returns a builder seeded with these options.
    pub fn to_builder(&self) -> ClientOptionsBuilder {
        ClientOptionsBuilder {
            entries: self.entries.clone(),
        }
    }
}

impl From<ClientOptions> for Message {
    fn from(options: ClientOptions) -> Self {
        Message::Dictionary(options.entries)
    }
}

/// Incremental builder for [`ClientOptions`].
///
/// Setting a key twice replaces the earlier value.
#[derive(Debug, Clone, Default)]
pub struct ClientOptionsBuilder {
    entries: Dictionary,
}

impl ClientOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `(key, value)` pair, validating it against the recognized keys.
    pub fn add(mut self, key: &str, value: impl Into<Message>) -> Result<Self, OptionsError> {
        let option = OptionKey::parse(key).ok_or_else(|| OptionsError::UnknownKey(key.to_string()))?;
        let value = option.validate(value.into())?;
        self.entries.insert(option.as_str().to_string(), value);
        Ok(self)
    }

    /// Adds an ordered list of `(key, value)` pairs.
    ///
    /// Stops at the first invalid pair.
    pub fn extend<K, V, I>(self, pairs: I) -> Result<Self, OptionsError>
    where
        K: AsRef<str>,
        V: Into<Message>,
        I: IntoIterator<Item = (K, V)>,
    {
        pairs
            .into_iter()
            .try_fold(self, |builder, (k, v)| builder.add(k.as_ref(), v))
    }

    /// Appends attribute names to `ReturnAttributes`, filtering browse results.
    pub fn set_return_attributes<S, I>(mut self, attributes: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        let entry = self
            .entries
            .entry(OptionKey::ReturnAttributes.as_str().to_string())
            .or_insert_with(|| Message::Array(Vec::new()));
        if let Message::Array(items) = entry {
            items.extend(attributes.into_iter().map(|a| Message::String(a.into())));
        }
        self
    }

    pub fn application_type(self, kind: ApplicationType) -> Self {
        self.insert(OptionKey::ApplicationType, kind.as_str())
    }

    pub fn archive_type(self, kind: ArchiveType) -> Self {
        self.insert(OptionKey::ArchiveType, kind.as_str())
    }

    /// Sets `PackageType`. Unlike the other typed setters this can fail,
    /// since an empty package type is rejected just as by [`add`](Self::add).
    pub fn package_type(self, package_type: impl Into<String>) -> Result<Self, OptionsError> {
        self.add(OptionKey::PackageType.as_str(), package_type.into())
    }

    pub fn skip_uninstall(self, skip: bool) -> Self {
        self.insert(OptionKey::SkipUninstall, skip)
    }

    pub fn itunes_metadata(self, data: impl Into<Vec<u8>>) -> Self {
        self.insert(OptionKey::ITunesMetadata, data.into())
    }

    pub fn application_sinf(self, data: impl Into<Vec<u8>>) -> Self {
        self.insert(OptionKey::ApplicationSinf, data.into())
    }

    pub fn bundle_ids<S, I>(self, ids: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        self.insert(OptionKey::BundleIds, Message::string_array(ids))
    }

    fn insert(mut self, key: OptionKey, value: impl Into<Message>) -> Self {
        self.entries.insert(key.as_str().to_string(), value.into());
        self
    }

    pub fn build(self) -> ClientOptions {
        ClientOptions {
            entries: self.entries,
        }
    }
}
