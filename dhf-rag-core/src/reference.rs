//! Bracket reference directives in prompt text
//!
//! Prompts name extra material with directives such as
//! `[Procedure|Design Controls]`, `[Context|General|plan.pdf]`,
//! `[General|plan.pdf]`, `[Master Record|Device Name]` or
//! `[Master Checklist]`. Parsing never fails: anything unrecognised in a
//! piped bracket becomes [`Reference::Unknown`].

use crate::document::CategoryKey;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Reference {
    Procedure { subcategory: String },
    Context {
        category: String,
        file_name: Option<String>,
    },
    MasterRecord { field: String },
    MasterChecklist,
    Unknown { raw: String },
}

/// Classified directive head
enum Head {
    Procedure,
    Context,
    MasterRecord,
    MasterChecklist,
    Category(String),
    Other,
}

fn classify_head(head: &str, known_categories: &[CategoryKey]) -> Head {
    let key = CategoryKey::new(head);
    match key.as_str() {
        "procedure" | "procedures" | "sop" => Head::Procedure,
        "context" => Head::Context,
        "master record" | "mr" => Head::MasterRecord,
        "master checklist" | "checklist" => Head::MasterChecklist,
        _ if known_categories.contains(&key) => Head::Category(head.trim().to_string()),
        _ => Head::Other,
    }
}

/// Parse one bracket body. `None` means the brackets were ordinary prose.
fn parse_directive(body: &str, known_categories: &[CategoryKey]) -> Option<Vec<Reference>> {
    let parts: Vec<&str> = body.split('|').map(str::trim).collect();
    let piped = parts.len() > 1;
    let args: Vec<&str> = parts[1..].iter().copied().filter(|a| !a.is_empty()).collect();
    let unknown = || {
        Some(vec![Reference::Unknown {
            raw: format!("[{body}]"),
        }])
    };

    match classify_head(parts[0], known_categories) {
        Head::Procedure if args.is_empty() => piped.then(|| unknown()).flatten(),
        Head::Procedure => Some(
            args.iter()
                .map(|a| Reference::Procedure {
                    subcategory: a.to_string(),
                })
                .collect(),
        ),
        Head::Context => match args.split_first() {
            Some((category, files)) => Some(context_refs(category, files)),
            None => piped.then(|| unknown()).flatten(),
        },
        Head::Category(category) => Some(context_refs(&category, &args)),
        Head::MasterRecord if args.is_empty() => piped.then(|| unknown()).flatten(),
        Head::MasterRecord => Some(
            args.iter()
                .map(|a| Reference::MasterRecord {
                    field: a.to_string(),
                })
                .collect(),
        ),
        Head::MasterChecklist => Some(vec![Reference::MasterChecklist]),
        Head::Other if piped => unknown(),
        Head::Other => None,
    }
}

fn context_refs(category: &str, files: &[&str]) -> Vec<Reference> {
    if files.is_empty() {
        return vec![Reference::Context {
            category: category.to_string(),
            file_name: None,
        }];
    }
    files
        .iter()
        .map(|f| Reference::Context {
            category: category.to_string(),
            file_name: Some(f.to_string()),
        })
        .collect()
}

/// Scan `prompt` for directives, in order of appearance, without duplicates.
///
/// `known_categories` lets a bare category head (`[General|a.pdf]`) act as a
/// context reference.
pub fn parse_references(prompt: &str, known_categories: &[CategoryKey]) -> Vec<Reference> {
    let mut refs: Vec<Reference> = Vec::new();
    let mut rest = prompt;

    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        let Some(close) = after.find(|c: char| c == ']' || c == '[' || c == '\n') else {
            break;
        };
        if !after[close..].starts_with(']') {
            // Unterminated on this line or nested; resume at the interruption
            rest = &after[close..];
            continue;
        }
        let body = &after[..close];
        if !body.trim().is_empty() {
            for r in parse_directive(body, known_categories).unwrap_or_default() {
                if !refs.contains(&r) {
                    refs.push(r);
                }
            }
        }
        rest = &after[close + 1..];
    }

    refs
}

/// Parsed directives of one prompt with lookup helpers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceSet {
    refs: Vec<Reference>,
}

impl ReferenceSet {
    /// Parse and log unknown directives.
    pub fn from_prompt(prompt: &str, known_categories: &[CategoryKey]) -> Self {
        let refs = parse_references(prompt, known_categories);
        for r in &refs {
            if let Reference::Unknown { raw } = r {
                tracing::warn!(directive = %raw, "ignoring unrecognised reference directive");
            }
        }
        Self { refs }
    }

    pub fn new(refs: Vec<Reference>) -> Self {
        Self { refs }
    }

    pub fn references(&self) -> &[Reference] {
        &self.refs
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Subcategory keys named by procedure references
    pub fn procedure_subcategories(&self) -> Vec<CategoryKey> {
        self.refs
            .iter()
            .filter_map(|r| match r {
                Reference::Procedure { subcategory } => Some(CategoryKey::new(subcategory)),
                _ => None,
            })
            .collect()
    }

    /// Whether a context reference names `category`, and `file_name` when
    /// the reference is narrowed to a file.
    pub fn names_context(&self, category: &str, file_name: &str) -> bool {
        let key = CategoryKey::new(category);
        self.refs.iter().any(|r| match r {
            Reference::Context {
                category: named,
                file_name: file,
            } => {
                CategoryKey::new(named) == key
                    && file
                        .as_deref()
                        .map_or(true, |f| f.trim().eq_ignore_ascii_case(file_name.trim()))
            }
            _ => false,
        })
    }

    pub fn master_record_fields(&self) -> Vec<&str> {
        self.refs
            .iter()
            .filter_map(|r| match r {
                Reference::MasterRecord { field } => Some(field.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn wants_master_checklist(&self) -> bool {
        self.refs.contains(&Reference::MasterChecklist)
    }

    pub fn unknown(&self) -> impl Iterator<Item = &str> {
        self.refs.iter().filter_map(|r| match r {
            Reference::Unknown { raw } => Some(raw.as_str()),
            _ => None,
        })
    }
}
