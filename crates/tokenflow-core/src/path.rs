use std::fmt;

use crate::error::{FlowError, Result};

/// Top-level section of a run context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Input,
    State,
    Output,
    Branch,
}

impl Section {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::State => "state",
            Self::Output => "output",
            Self::Branch => "_branch",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "input" => Some(Self::Input),
            "state" => Some(Self::State),
            "output" => Some(Self::Output),
            "_branch" => Some(Self::Branch),
            _ => None,
        }
    }
}

/// A parsed dot path such as `state.pipeline.stages.phase1.results`.
///
/// Numeric segments index into arrays when the value at that point is an
/// array, and are plain object keys otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextPath {
    section: Section,
    segments: Vec<String>,
}

impl ContextPath {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(FlowError::InvalidPath(raw.to_string()));
        }
        let mut parts = raw.split('.');
        let head = parts.next().unwrap_or_default();
        let section = Section::parse(head).ok_or_else(|| FlowError::InvalidPath(raw.to_string()))?;
        let mut segments = Vec::new();
        for part in parts {
            if part.is_empty() {
                return Err(FlowError::InvalidPath(raw.to_string()));
            }
            segments.push(part.to_string());
        }
        Ok(Self { section, segments })
    }

    pub fn section(&self) -> Section {
        self.section
    }

    /// Segments below the section key.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True when the path names a whole section (`state`, `output`, ...).
    pub fn is_section_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// For `_branch.<id>.rest`, the first segment.
    pub fn branch_key(&self) -> Option<&str> {
        match self.section {
            Section::Branch => self.segments.first().map(String::as_str),
            _ => None,
        }
    }

    /// Re-root a `_branch.<rest>` path at `_branch.<token_id>.<rest>`.
    pub fn scoped_to(&self, token_id: &str) -> ContextPath {
        let mut segments = Vec::with_capacity(self.segments.len() + 1);
        segments.push(token_id.to_string());
        segments.extend(self.segments.iter().cloned());
        ContextPath {
            section: Section::Branch,
            segments,
        }
    }

    /// Strip the leading branch key of a `_branch.<id>.rest` path.
    pub fn without_branch_key(&self) -> ContextPath {
        ContextPath {
            section: self.section,
            segments: self.segments.iter().skip(1).cloned().collect(),
        }
    }
}

impl fmt::Display for ContextPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.section.key())?;
        for seg in &self.segments {
            write!(f, ".{}", seg)?;
        }
        Ok(())
    }
}

/// Resolve `segments` inside `root`, indexing arrays by numeric segments.
pub fn lookup<'a>(root: &'a serde_json::Value, segments: &[String]) -> Option<&'a serde_json::Value> {
    let mut current = root;
    for seg in segments {
        current = match current {
            serde_json::Value::Object(map) => map.get(seg)?,
            serde_json::Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
