use crate::error::ExportError;
use crate::types::Mm;
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId(String);

impl SectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SectionId {
    fn from(value: &str) -> Self {
        SectionId::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakPolicy {
    Flow,
    AvoidBreak,
    ForcePageBreak,
}

impl BreakPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakPolicy::Flow => "flow",
            BreakPolicy::AvoidBreak => "avoid-break",
            BreakPolicy::ForcePageBreak => "force-page-break",
        }
    }

    // Atomic sections are never sliced by the planner.
    pub fn is_atomic(&self) -> bool {
        !matches!(self, BreakPolicy::Flow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextRole {
    Heading,
    Body,
    Caption,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentNode {
    Text {
        role: TextRole,
        text: String,
    },
    Image {
        source: String,
        alt: String,
        // height / width; used to reserve space before the bytes are known.
        aspect: Option<f32>,
        max_height: Option<Mm>,
    },
    Table {
        header: Vec<String>,
        rows: Vec<Vec<String>>,
    },
}

impl ContentNode {
    pub fn heading(text: impl Into<String>) -> Self {
        ContentNode::Text {
            role: TextRole::Heading,
            text: text.into(),
        }
    }

    pub fn body(text: impl Into<String>) -> Self {
        ContentNode::Text {
            role: TextRole::Body,
            text: text.into(),
        }
    }

    pub fn caption(text: impl Into<String>) -> Self {
        ContentNode::Text {
            role: TextRole::Caption,
            text: text.into(),
        }
    }

    pub fn image(source: impl Into<String>, alt: impl Into<String>) -> Self {
        ContentNode::Image {
            source: source.into(),
            alt: alt.into(),
            aspect: None,
            max_height: None,
        }
    }

    pub fn table(header: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        ContentNode::Table { header, rows }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportSection {
    pub id: SectionId,
    pub order: u32,
    pub break_policy: BreakPolicy,
    pub content: Vec<ContentNode>,
}

impl ReportSection {
    pub fn new(id: impl Into<String>, order: u32, break_policy: BreakPolicy) -> Self {
        Self {
            id: SectionId::new(id),
            order,
            break_policy,
            content: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: ContentNode) -> Self {
        self.content.push(node);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentTree {
    pub title: String,
    sections: Vec<ReportSection>,
}

impl ContentTree {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            sections: Vec::new(),
        }
    }

    pub fn with_sections(title: impl Into<String>, sections: Vec<ReportSection>) -> Self {
        let mut tree = Self::new(title);
        for section in sections {
            tree.push(section);
        }
        tree
    }

    // Keeps sections sorted by `order`; equal orders keep insertion order so
    // that validation can report the collision.
    pub fn push(&mut self, section: ReportSection) {
        let idx = self
            .sections
            .partition_point(|existing| existing.order <= section.order);
        self.sections.insert(idx, section);
    }

    pub fn sections(&self) -> &[ReportSection] {
        &self.sections
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn section(&self, id: &SectionId) -> Option<&ReportSection> {
        self.sections.iter().find(|section| &section.id == id)
    }

    /// Checks the tree before any measuring or rendering happens.
    pub fn validate(&self) -> Result<(), ExportError> {
        if self.sections.is_empty() {
            return Err(ExportError::NoContent);
        }
        let mut ids: HashSet<&str> = HashSet::with_capacity(self.sections.len());
        let mut orders: HashSet<u32> = HashSet::with_capacity(self.sections.len());
        for (idx, section) in self.sections.iter().enumerate() {
            if section.id.as_str().trim().is_empty() {
                return Err(ExportError::Structural(format!(
                    "section at position {} has no id",
                    idx
                )));
            }
            if !ids.insert(section.id.as_str()) {
                return Err(ExportError::Structural(format!(
                    "duplicate section id '{}'",
                    section.id
                )));
            }
            if !orders.insert(section.order) {
                return Err(ExportError::Structural(format!(
                    "section '{}' reuses order {}",
                    section.id, section.order
                )));
            }
        }
        Ok(())
    }
}
