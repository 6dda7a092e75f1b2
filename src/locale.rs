//! Locale negotiation.
//!
//! Priority: path prefix (`/he/...`) > `?lang=` override > `Accept-Language`
//! > configured default.

/// Query parameter that overrides header negotiation.
pub const LOCALE_QUERY_PARAM: &str = "lang";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLocale {
    /// Negotiated locale tag, always one of the supported tags
    pub tag: String,
    /// Whether the request path itself started with a supported locale
    pub path_prefixed: bool,
    /// Request path with the locale prefix removed (`/` for a bare prefix)
    pub stripped_path: String,
}

#[derive(Debug)]
pub enum LocaleError {
    NoLocales,
    InvalidTag(String),
    DefaultNotSupported(String),
}

impl std::fmt::Display for LocaleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocaleError::NoLocales => write!(f, "At least one supported locale is required"),
            LocaleError::InvalidTag(tag) => write!(f, "Invalid locale tag: {:?}", tag),
            LocaleError::DefaultNotSupported(tag) => {
                write!(f, "Default locale {} is not in the supported list", tag)
            }
        }
    }
}

impl std::error::Error for LocaleError {}

#[derive(Debug, Clone)]
pub struct LocaleResolver {
    supported: Vec<String>,
    default: String,
}

impl LocaleResolver {
    pub fn new<I, S>(supported: I, default: &str) -> Result<Self, LocaleError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tags = Vec::new();
        for tag in supported {
            let tag = tag.as_ref().trim().to_ascii_lowercase();
            let valid = !tag.is_empty()
                && tag
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-');
            if !valid {
                return Err(LocaleError::InvalidTag(tag));
            }
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        if tags.is_empty() {
            return Err(LocaleError::NoLocales);
        }

        let default = default.trim().to_ascii_lowercase();
        if !tags.contains(&default) {
            return Err(LocaleError::DefaultNotSupported(default));
        }

        Ok(Self {
            supported: tags,
            default,
        })
    }

    pub fn supported(&self) -> &[String] {
        &self.supported
    }

    pub fn default_locale(&self) -> &str {
        &self.default
    }

    pub fn resolve(
        &self,
        path: &str,
        query: Option<&str>,
        accept_language: Option<&str>,
    ) -> ResolvedLocale {
        if let Some((tag, rest)) = self.split_prefix(path) {
            return ResolvedLocale {
                tag: tag.to_string(),
                path_prefixed: true,
                stripped_path: if rest.is_empty() {
                    "/".to_string()
                } else {
                    rest.to_string()
                },
            };
        }

        let tag = query
            .and_then(|q| self.from_query(q))
            .or_else(|| accept_language.and_then(|h| self.negotiate(h)))
            .unwrap_or(self.default.as_str());

        ResolvedLocale {
            tag: tag.to_string(),
            path_prefixed: false,
            stripped_path: path.to_string(),
        }
    }

    /// Split `/he/blog` into (`he`, `/blog`). `/he` yields an empty rest.
    fn split_prefix<'p>(&self, path: &'p str) -> Option<(&str, &'p str)> {
        let trimmed = path.strip_prefix('/')?;
        let (segment, rest) = match trimmed.find('/') {
            Some(idx) => (&trimmed[..idx], &trimmed[idx..]),
            None => (trimmed, ""),
        };
        self.supported
            .iter()
            .find(|tag| tag.as_str() == segment)
            .map(|tag| (tag.as_str(), rest))
    }

    fn from_query(&self, query: &str) -> Option<&str> {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == LOCALE_QUERY_PARAM)
            .and_then(|(_, value)| self.match_tag(&value))
    }

    /// Pick the highest-weighted supported tag from an `Accept-Language` value.
    pub fn negotiate(&self, header: &str) -> Option<&str> {
        let mut best: Option<(f32, &str)> = None;

        for entry in header.split(',') {
            let mut parts = entry.split(';');
            let tag = parts.next().unwrap_or("").trim();
            if tag.is_empty() || tag == "*" {
                continue;
            }

            let mut weight = 1.0_f32;
            for param in parts {
                if let Some(q) = param.trim().strip_prefix("q=") {
                    weight = match q.trim().parse::<f32>() {
                        Ok(q) if (0.0..=1.0).contains(&q) => q,
                        _ => 0.0,
                    };
                }
            }
            if weight <= 0.0 {
                continue;
            }

            if let Some(matched) = self.match_tag(tag) {
                // Strictly greater keeps the earliest of equally weighted tags.
                if best.is_none_or(|(w, _)| weight > w) {
                    best = Some((weight, matched));
                }
            }
        }

        best.map(|(_, tag)| tag)
    }

    /// Match a tag exactly, then by its primary subtag (`he-IL` -> `he`).
    fn match_tag(&self, tag: &str) -> Option<&str> {
        let tag = tag.trim().to_ascii_lowercase().replace('_', "-");
        if let Some(found) = self.supported.iter().find(|s| **s == tag) {
            return Some(found.as_str());
        }
        let primary = tag.split('-').next().unwrap_or("");
        self.supported
            .iter()
            .find(|s| s.as_str() == primary)
            .map(String::as_str)
    }
}
