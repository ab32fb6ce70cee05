use std::collections::HashSet;

use serde_json::{Map, Value};

use tokenflow_core::error::{FlowError, Result};
use tokenflow_core::path::{lookup, ContextPath, Section};
use tokenflow_core::traits::ContextRead;
use tokenflow_core::types::TokenId;

/// The nested, mutable document of one workflow run.
///
/// Four sections are addressable by dot path: `input` (read-only after start),
/// `state`, `output` and `_branch`. Branch data lives under
/// `_branch.<tokenId>` and is only reachable through a token's lineage
/// (see [`RunContext::read_scoped`]) or by its explicit token id.
#[derive(Debug, Clone)]
pub struct RunContext {
    doc: Value,
    branch_writes: HashSet<(TokenId, String)>,
}

impl RunContext {
    pub fn new(input: Value) -> Self {
        let mut doc = Map::new();
        doc.insert(Section::Input.key().into(), input);
        doc.insert(Section::State.key().into(), Value::Object(Map::new()));
        doc.insert(Section::Output.key().into(), Value::Object(Map::new()));
        doc.insert(Section::Branch.key().into(), Value::Object(Map::new()));
        Self {
            doc: Value::Object(doc),
            branch_writes: HashSet::new(),
        }
    }

    /// Rebuild from a persisted document. Missing sections are recreated.
    pub fn from_document(doc: Value) -> Result<Self> {
        let Value::Object(mut map) = doc else {
            return Err(FlowError::InvalidPath("context document is not an object".into()));
        };
        for section in [Section::State, Section::Output, Section::Branch] {
            map.entry(section.key().to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        map.entry(Section::Input.key().to_string()).or_insert(Value::Null);
        Ok(Self {
            doc: Value::Object(map),
            branch_writes: HashSet::new(),
        })
    }

    /// The full document, `_branch` included.
    pub fn document(&self) -> &Value {
        &self.doc
    }

    fn section(&self, section: Section) -> Option<&Value> {
        self.doc.get(section.key())
    }

    fn section_mut(&mut self, section: Section) -> Result<&mut Value> {
        let Value::Object(map) = &mut self.doc else {
            return Err(FlowError::PathConflict(section.key().into()));
        };
        Ok(map
            .entry(section.key().to_string())
            .or_insert_with(|| Value::Object(Map::new())))
    }

    /// Read a path. `Ok(None)` means undefined (missing intermediate or leaf).
    pub fn read(&self, path: &str) -> Result<Option<Value>> {
        let parsed = ContextPath::parse(path)?;
        Ok(self.read_parsed(&parsed))
    }

    fn read_parsed(&self, path: &ContextPath) -> Option<Value> {
        self.section(path.section())
            .and_then(|root| lookup(root, path.segments()))
            .cloned()
    }

    /// Read on behalf of a token.
    ///
    /// `lineage` lists the token and its same-branch ancestors, nearest first.
    /// `_branch.<rest>` resolves to the nearest `_branch.<id>.<rest>` in the
    /// lineage; `_branch.<id>.<rest>` is only visible when `<id>` is in the
    /// lineage. Other sections read as usual.
    pub fn read_scoped(&self, path: &str, lineage: &[TokenId]) -> Result<Option<Value>> {
        let parsed = ContextPath::parse(path)?;
        if parsed.section() != Section::Branch {
            return Ok(self.read_parsed(&parsed));
        }
        let Some(key) = parsed.branch_key() else {
            return Ok(None);
        };
        if lineage.iter().any(|id| id.as_str() == key) {
            return Ok(self.read_parsed(&parsed));
        }
        for id in lineage {
            if let Some(value) = self.read_parsed(&parsed.scoped_to(id.as_str())) {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Set a value, creating intermediate objects as needed.
    ///
    /// `input` is read-only and `_branch` is only written through
    /// [`RunContext::write_branch`].
    pub fn set_field(&mut self, path: &str, value: Value) -> Result<()> {
        let parsed = ContextPath::parse(path)?;
        match parsed.section() {
            Section::Input | Section::Branch => Err(FlowError::ReadOnlySection(path.to_string())),
            section => {
                if parsed.is_section_root() && !value.is_object() {
                    return Err(FlowError::PathConflict(path.to_string()));
                }
                let root = self.section_mut(section)?;
                set_at(root, parsed.segments(), value, path)
            }
        }
    }

    /// Replace a whole subtree (or section) with `data`.
    pub fn replace_section(&mut self, path: &str, data: Value) -> Result<()> {
        self.set_field(path, data)
    }

    /// Write a token's branch-local value. `path` is `_branch.<rest>` and lands
    /// at `_branch.<tokenId>.<rest>`; each path is written at most once per
    /// token.
    pub fn write_branch(&mut self, token_id: &TokenId, path: &str, value: Value) -> Result<String> {
        let parsed = ContextPath::parse(path)?;
        if parsed.section() != Section::Branch || parsed.is_section_root() {
            return Err(FlowError::InvalidPath(path.to_string()));
        }
        let key = (token_id.clone(), parsed.to_string());
        if self.branch_writes.contains(&key) {
            return Err(FlowError::BranchAlreadyWritten(token_id.to_string()));
        }
        let scoped = parsed.scoped_to(token_id.as_str());
        let full = scoped.to_string();
        let root = self.section_mut(Section::Branch)?;
        set_at(root, scoped.segments(), value, &full)?;
        self.branch_writes.insert(key);
        Ok(full)
    }

    /// Drop a token's branch data once it has been merged.
    pub fn dispose_branch(&mut self, token_id: &TokenId) -> bool {
        self.branch_writes.retain(|(id, _)| id != token_id);
        match self.doc.get_mut(Section::Branch.key()) {
            Some(Value::Object(map)) => map.remove(token_id.as_str()).is_some(),
            _ => false,
        }
    }

    /// Deep, independent copy of `{input, state, output}`.
    pub fn snapshot(&self) -> Value {
        let mut out = Map::new();
        for section in [Section::Input, Section::State, Section::Output] {
            out.insert(
                section.key().to_string(),
                self.section(section).cloned().unwrap_or(Value::Null),
            );
        }
        Value::Object(out)
    }

    /// A read-only view bound to one token's lineage.
    pub fn scoped<'a>(&'a self, lineage: &'a [TokenId]) -> ScopedView<'a> {
        ScopedView { ctx: self, lineage }
    }
}

/// Context as seen by one token: conditions and predicates read through this.
pub struct ScopedView<'a> {
    ctx: &'a RunContext,
    lineage: &'a [TokenId],
}

impl ContextRead for ScopedView<'_> {
    fn read_path(&self, path: &str) -> Option<Value> {
        self.ctx.read_scoped(path, self.lineage).ok().flatten()
    }
}

fn set_at(root: &mut Value, segments: &[String], value: Value, path: &str) -> Result<()> {
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return Ok(());
    };

    let mut current = root;
    for seg in parents {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map
                .entry(seg.clone())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => {
                let len = items.len();
                match seg.parse::<usize>() {
                    Ok(idx) if idx < len => &mut items[idx],
                    _ => return Err(FlowError::PathConflict(path.to_string())),
                }
            }
            _ => return Err(FlowError::PathConflict(path.to_string())),
        };
    }

    if current.is_null() {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => match last.parse::<usize>() {
            Ok(idx) if idx < items.len() => {
                items[idx] = value;
                Ok(())
            }
            Ok(idx) if idx == items.len() => {
                items.push(value);
                Ok(())
            }
            _ => Err(FlowError::PathConflict(path.to_string())),
        },
        _ => Err(FlowError::PathConflict(path.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tid(s: &str) -> TokenId {
        TokenId::from_string(s)
    }

    #[test]
    fn test_read_missing_is_undefined() {
        let ctx = RunContext::new(json!({"topic": "rust"}));
        assert_eq!(ctx.read("input.topic").unwrap(), Some(json!("rust")));
        assert_eq!(ctx.read("state.a.b.c").unwrap(), None);
        assert!(matches!(ctx.read("state..a"), Err(FlowError::InvalidPath(_))));
    }

    #[test]
    fn test_set_field_creates_intermediates() {
        let mut ctx = RunContext::new(json!({}));
        ctx.set_field("state.pipeline.stages.phase1.results", json!([1, 2]))
            .unwrap();
        assert_eq!(
            ctx.read("state.pipeline.stages.phase1.results").unwrap(),
            Some(json!([1, 2]))
        );
        ctx.set_field("state.pipeline.stages.phase1.results.1", json!(9))
            .unwrap();
        assert_eq!(
            ctx.read("state.pipeline.stages.phase1.results").unwrap(),
            Some(json!([1, 9]))
        );
    }

    #[test]
    fn test_set_field_through_scalar_conflicts() {
        let mut ctx = RunContext::new(json!({}));
        ctx.set_field("state.name", json!("x")).unwrap();
        assert!(matches!(
            ctx.set_field("state.name.first", json!("y")),
            Err(FlowError::PathConflict(_))
        ));
    }

    #[test]
    fn test_input_is_read_only() {
        let mut ctx = RunContext::new(json!({"a": 1}));
        assert!(matches!(
            ctx.set_field("input.a", json!(2)),
            Err(FlowError::ReadOnlySection(_))
        ));
        assert!(matches!(
            ctx.set_field("_branch.x", json!(2)),
            Err(FlowError::ReadOnlySection(_))
        ));
    }

    #[test]
    fn test_replace_section() {
        let mut ctx = RunContext::new(json!({}));
        ctx.set_field("state.a.b", json!(1)).unwrap();
        ctx.replace_section("state.a", json!({"c": 2})).unwrap();
        assert_eq!(ctx.read("state.a.b").unwrap(), None);
        ctx.replace_section("state", json!({"fresh": true})).unwrap();
        assert_eq!(ctx.read("state").unwrap(), Some(json!({"fresh": true})));
        assert!(ctx.replace_section("output", json!([1])).is_err());
    }

    #[test]
    fn test_branch_isolation() {
        let mut ctx = RunContext::new(json!({}));
        let full = ctx
            .write_branch(&tid("t1"), "_branch.output.word", json!("alpha"))
            .unwrap();
        assert_eq!(full, "_branch.t1.output.word");
        ctx.write_branch(&tid("t2"), "_branch.output.word", json!("beta"))
            .unwrap();

        let own = [tid("t1")];
        assert_eq!(
            ctx.read_scoped("_branch.output.word", &own).unwrap(),
            Some(json!("alpha"))
        );
        // a sibling's data is invisible, even by explicit id
        assert_eq!(ctx.read_scoped("_branch.t2.output.word", &own).unwrap(), None);
        // the merge step addresses branches by id
        assert_eq!(
            ctx.read("_branch.t2.output.word").unwrap(),
            Some(json!("beta"))
        );
    }

    #[test]
    fn test_lineage_sees_ancestor_writes() {
        let mut ctx = RunContext::new(json!({}));
        ctx.write_branch(&tid("step1"), "_branch.output.draft", json!("d"))
            .unwrap();
        let lineage = [tid("step2"), tid("step1")];
        assert_eq!(
            ctx.read_scoped("_branch.output.draft", &lineage).unwrap(),
            Some(json!("d"))
        );
        assert_eq!(ctx.scoped(&lineage).read_path("_branch.output.draft"), Some(json!("d")));
    }

    #[test]
    fn test_branch_write_once() {
        let mut ctx = RunContext::new(json!({}));
        ctx.write_branch(&tid("t1"), "_branch.output", json!(1)).unwrap();
        assert!(matches!(
            ctx.write_branch(&tid("t1"), "_branch.output", json!(2)),
            Err(FlowError::BranchAlreadyWritten(_))
        ));
        assert!(ctx.dispose_branch(&tid("t1")));
        assert_eq!(ctx.read("_branch.t1").unwrap(), None);
        assert!(!ctx.dispose_branch(&tid("t1")));
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut ctx = RunContext::new(json!({"q": 1}));
        ctx.set_field("state.n", json!(1)).unwrap();
        ctx.write_branch(&tid("t"), "_branch.x", json!(1)).unwrap();
        let snap = ctx.snapshot();
        ctx.set_field("state.n", json!(2)).unwrap();
        assert_eq!(snap["state"]["n"], json!(1));
        assert!(snap.get("_branch").is_none());
    }

    #[test]
    fn test_from_document_fills_sections() {
        let ctx = RunContext::from_document(json!({"input": {"a": 1}, "state": {"s": 2}})).unwrap();
        assert_eq!(ctx.read("state.s").unwrap(), Some(json!(2)));
        assert_eq!(ctx.read("output").unwrap(), Some(json!({})));
        assert!(RunContext::from_document(json!([1])).is_err());
    }
}
