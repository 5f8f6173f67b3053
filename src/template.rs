//! Vendor template patching.
//!
//! Vendor configuration templates carry reserved placeholder tokens
//! (`{{CALLSIGN}}`, `{{GRID}}`, ...) that the vendor's own launcher substitutes
//! every time the application starts. The build may add directives to these
//! files but must never touch a token. To make that structural rather than a
//! matter of careful string handling, every line is parsed into
//! [`Segment::FixedText`] and [`Segment::ReservedPlaceholder`] pieces, and
//! rendering a parsed line reproduces it byte for byte.
//!
//! Generated directives live inside a marked block:
//!
//! ```text
//! # BEGIN emcomm-iso generated
//! directive one
//! directive two
//! # END emcomm-iso generated
//! ```
//!
//! A patch first removes any such block left by an earlier run, then inserts
//! the fresh block next to its anchor line, so patching is idempotent.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Owner name written into block markers.
pub const BLOCK_OWNER: &str = "emcomm-iso";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("directive would introduce a reserved placeholder: {0}")]
    DirectiveContainsPlaceholder(String),

    #[error("directive spans multiple lines: {0:?}")]
    MultilineDirective(String),

    #[error("anchor line not found: {0}")]
    AnchorNotFound(String),

    #[error("generated block opened on line {0} is never closed")]
    UnterminatedBlock(usize),

    #[error("reserved placeholders changed: before {before:?}, after {after:?}")]
    PlaceholderChanged {
        before: Vec<String>,
        after: Vec<String>,
    },
}

/// Delimiters of the vendor's runtime-substitution syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaceholderSyntax {
    pub open: &'static str,
    pub close: &'static str,
}

impl Default for PlaceholderSyntax {
    fn default() -> Self {
        Self {
            open: "{{",
            close: "}}",
        }
    }
}

/// A piece of a template line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal text owned by whoever wrote the line.
    FixedText(String),
    /// Token resolved by the vendor at runtime. Opaque to the build.
    ReservedPlaceholder(String),
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Split one line into fixed text and placeholder segments.
pub fn parse_line(line: &str, syntax: PlaceholderSyntax) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut rest = line;

    while let Some(start) = rest.find(syntax.open) {
        let after_open = &rest[start + syntax.open.len()..];
        match after_open.find(syntax.close) {
            Some(end) if is_placeholder_name(&after_open[..end]) => {
                text.push_str(&rest[..start]);
                if !text.is_empty() {
                    segments.push(Segment::FixedText(std::mem::take(&mut text)));
                }
                segments.push(Segment::ReservedPlaceholder(after_open[..end].to_string()));
                rest = &after_open[end + syntax.close.len()..];
            }
            _ => {
                // Not a token: keep the opening delimiter as text and move on.
                text.push_str(&rest[..start + syntax.open.len()]);
                rest = after_open;
            }
        }
    }
    text.push_str(rest);
    if !text.is_empty() {
        segments.push(Segment::FixedText(text));
    }
    segments
}

/// One parsed template line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateLine {
    pub segments: Vec<Segment>,
}

impl TemplateLine {
    fn fixed(text: &str) -> Self {
        Self {
            segments: vec![Segment::FixedText(text.to_string())],
        }
    }

    pub fn render(&self, syntax: PlaceholderSyntax) -> String {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::FixedText(t) => out.push_str(t),
                Segment::ReservedPlaceholder(name) => {
                    out.push_str(syntax.open);
                    out.push_str(name);
                    out.push_str(syntax.close);
                }
            }
        }
        out
    }

    fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::ReservedPlaceholder(name) => Some(name.as_str()),
            Segment::FixedText(_) => None,
        })
    }
}

/// A whole template file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub lines: Vec<TemplateLine>,
    trailing_newline: bool,
    syntax: PlaceholderSyntax,
}

impl Template {
    pub fn parse(text: &str, syntax: PlaceholderSyntax) -> Self {
        let trailing_newline = text.ends_with('\n');
        let body = text.strip_suffix('\n').unwrap_or(text);
        let lines = if text.is_empty() {
            Vec::new()
        } else {
            body.split('\n')
                .map(|l| TemplateLine {
                    segments: parse_line(l, syntax),
                })
                .collect()
        };
        Self {
            lines,
            trailing_newline,
            syntax,
        }
    }

    pub fn render(&self) -> String {
        let mut out = self
            .lines
            .iter()
            .map(|l| l.render(self.syntax))
            .collect::<Vec<_>>()
            .join("\n");
        if self.trailing_newline && !self.lines.is_empty() {
            out.push('\n');
        }
        out
    }

    /// Every placeholder name in file order.
    pub fn placeholders(&self) -> Vec<String> {
        self.lines
            .iter()
            .flat_map(|l| l.placeholders())
            .map(str::to_string)
            .collect()
    }
}

/// Where the generated block goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anchor {
    /// Directly after the first line starting with this text.
    After(String),
    /// Directly before the first line starting with this text.
    Before(String),
    /// At the end of the file.
    End,
}

/// A set of directives to place in one template.
#[derive(Debug, Clone)]
pub struct PatchSpec {
    /// Comment leader of the template's format (`#`, `;`).
    pub comment: String,
    pub anchor: Anchor,
    pub directives: Vec<String>,
}

impl PatchSpec {
    pub fn new(comment: &str, anchor: Anchor, directives: Vec<String>) -> Self {
        Self {
            comment: comment.to_string(),
            anchor,
            directives,
        }
    }

    fn begin_marker(&self) -> String {
        format!("{} BEGIN {} generated", self.comment, BLOCK_OWNER)
    }

    fn end_marker(&self) -> String {
        format!("{} END {} generated", self.comment, BLOCK_OWNER)
    }
}

fn strip_generated(
    lines: Vec<TemplateLine>,
    spec: &PatchSpec,
    syntax: PlaceholderSyntax,
) -> Result<Vec<TemplateLine>, TemplateError> {
    let begin = spec.begin_marker();
    let end = spec.end_marker();
    let mut kept = Vec::with_capacity(lines.len());
    let mut open_at: Option<usize> = None;

    for (idx, line) in lines.into_iter().enumerate() {
        let rendered = line.render(syntax);
        let trimmed = rendered.trim();
        match open_at {
            None if trimmed == begin => open_at = Some(idx + 1),
            None => kept.push(line),
            Some(_) if trimmed == end => open_at = None,
            Some(_) => {}
        }
    }

    match open_at {
        Some(line_no) => Err(TemplateError::UnterminatedBlock(line_no)),
        None => Ok(kept),
    }
}

/// Apply `spec` to template text.
pub fn patch(
    text: &str,
    spec: &PatchSpec,
    syntax: PlaceholderSyntax,
) -> Result<String, TemplateError> {
    for d in &spec.directives {
        if d.contains('\n') {
            return Err(TemplateError::MultilineDirective(d.clone()));
        }
        if parse_line(d, syntax)
            .iter()
            .any(|s| matches!(s, Segment::ReservedPlaceholder(_)))
        {
            return Err(TemplateError::DirectiveContainsPlaceholder(d.clone()));
        }
    }

    let mut template = Template::parse(text, syntax);
    template.lines = strip_generated(std::mem::take(&mut template.lines), spec, syntax)?;
    let before = template.placeholders();

    let insert_at = match &spec.anchor {
        Anchor::End => template.lines.len(),
        Anchor::After(pat) | Anchor::Before(pat) => {
            let idx = template
                .lines
                .iter()
                .position(|l| l.render(syntax).trim_start().starts_with(pat.as_str()))
                .ok_or_else(|| TemplateError::AnchorNotFound(pat.clone()))?;
            if matches!(spec.anchor, Anchor::After(_)) {
                idx + 1
            } else {
                idx
            }
        }
    };

    if !spec.directives.is_empty() {
        let mut block = Vec::with_capacity(spec.directives.len() + 2);
        block.push(TemplateLine::fixed(&spec.begin_marker()));
        block.extend(spec.directives.iter().map(|d| TemplateLine::fixed(d)));
        block.push(TemplateLine::fixed(&spec.end_marker()));
        template.lines.splice(insert_at..insert_at, block);
        if template.lines.len() == spec.directives.len() + 2 {
            // Block is the whole file; terminate the last line.
            template.trailing_newline = true;
        }
    }

    let after = template.placeholders();
    if before != after {
        return Err(TemplateError::PlaceholderChanged { before, after });
    }

    Ok(template.render())
}

/// Result of patching a template on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Template absent; the feature is skipped.
    Missing,
    /// File already had exactly this content.
    Unchanged,
    /// File rewritten.
    Updated,
}

/// Patch a template file in place. The rewrite is atomic and keeps the
/// file's permissions.
pub fn patch_file(path: &Path, spec: &PatchSpec, syntax: PlaceholderSyntax) -> Result<PatchOutcome> {
    if !path.is_file() {
        return Ok(PatchOutcome::Missing);
    }

    let original = fs::read_to_string(path)
        .with_context(|| format!("Failed to read template {}", path.display()))?;
    let patched = patch(&original, spec, syntax)
        .with_context(|| format!("Failed to patch template {}", path.display()))?;

    if patched == original {
        debug!(template = %path.display(), "template already up to date");
        return Ok(PatchOutcome::Unchanged);
    }

    let perms = fs::metadata(path)?.permissions();
    let file_name = path
        .file_name()
        .context("Template path has no file name")?
        .to_string_lossy();
    let tmp = path.with_file_name(format!(".{}.emcomm-tmp", file_name));
    fs::write(&tmp, &patched).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::set_permissions(&tmp, perms)?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;

    debug!(template = %path.display(), "template patched");
    Ok(PatchOutcome::Updated)
}
