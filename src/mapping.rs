use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A template source bound to an optional destination file and an optional
/// dependent service.
///
/// Written as `<source>[:<destination>[:<service>]]`. Empty segments are
/// treated as absent, so `nginx.tmpl::proxy` renders without writing and
/// still restarts `proxy` when the output changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateMapping {
    pub source: PathBuf,
    pub destination: Option<PathBuf>,
    pub service: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("template mapping '{0}' has no source path")]
    MissingSource(String),

    #[error("template mapping '{0}' has more than three ':'-separated parts")]
    TooManyParts(String),
}

impl FromStr for TemplateMapping {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() > 3 {
            return Err(MappingError::TooManyParts(s.to_string()));
        }

        let part = |idx: usize| {
            parts
                .get(idx)
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
        };

        let source = part(0).ok_or_else(|| MappingError::MissingSource(s.to_string()))?;

        Ok(Self {
            source: PathBuf::from(source),
            destination: part(1).map(PathBuf::from),
            service: part(2).map(str::to_string),
        })
    }
}

impl fmt::Display for TemplateMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source.display())?;
        if let Some(dest) = &self.destination {
            write!(f, " -> {}", dest.display())?;
        }
        if let Some(service) = &self.service {
            write!(f, " (restarts {})", service)?;
        }
        Ok(())
    }
}

/// Parses every mapping string, failing on the first malformed one.
pub fn parse_mappings<S: AsRef<str>>(entries: &[S]) -> Result<Vec<TemplateMapping>, MappingError> {
    entries.iter().map(|s| s.as_ref().parse()).collect()
}
