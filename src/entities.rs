//! Static description of the importable entity graph.
//!
//! Every table the loader touches is described here: where it lives, which
//! columns point at other entities, which columns are machine-specific, and
//! which columns are forced to the importing user. Nothing here talks to the
//! database.

use serde::Serialize;
use std::fmt;

/// Entity types that take part in a project import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Project,
    /// A field with no owning project. Shares the `fields` table with [`EntityType::Field`].
    GlobalField,
    Context,
    Field,
    FieldOption,
    Template,
    TemplateField,
    Instance,
    Note,
    ProjectLink,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Project => "project",
            EntityType::GlobalField => "global_field",
            EntityType::Context => "context",
            EntityType::Field => "field",
            EntityType::FieldOption => "field_option",
            EntityType::Template => "template",
            EntityType::TemplateField => "template_field",
            EntityType::Instance => "instance",
            EntityType::Note => "note",
            EntityType::ProjectLink => "project_link",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        INSERT_ORDER.iter().copied().find(|e| e.as_str() == s)
    }

    /// Table holding rows of this entity type.
    pub fn table(&self) -> &'static str {
        match self {
            EntityType::Project => "projects",
            EntityType::GlobalField | EntityType::Field => "fields",
            EntityType::Context => "contexts",
            EntityType::FieldOption => "field_options",
            EntityType::Template => "templates",
            EntityType::TemplateField => "template_fields",
            EntityType::Instance => "instances",
            EntityType::Note => "notes",
            EntityType::ProjectLink => "project_links",
        }
    }

    /// Whether the table has a generated surrogate key.
    ///
    /// Composite-keyed link tables return `false`; inserting into them yields no id.
    pub fn has_auto_increment(&self) -> bool {
        !matches!(self, EntityType::TemplateField)
    }

    /// Foreign keys declared on this entity's table.
    pub fn foreign_keys(&self) -> &'static [ForeignKey] {
        match self {
            EntityType::Project | EntityType::GlobalField => &[],
            EntityType::Context => CONTEXT_KEYS,
            EntityType::Field => FIELD_KEYS,
            EntityType::FieldOption => FIELD_OPTION_KEYS,
            EntityType::Template => TEMPLATE_KEYS,
            EntityType::TemplateField => TEMPLATE_FIELD_KEYS,
            EntityType::Instance => INSTANCE_KEYS,
            EntityType::Note => NOTE_KEYS,
            EntityType::ProjectLink => PROJECT_LINK_KEYS,
        }
    }

    /// Columns nulled on load because their values only make sense on the source machine.
    pub fn excluded_columns(&self) -> &'static [&'static str] {
        match self {
            EntityType::Project => &["local_path", "deleted_at"],
            // Global fields are created before any context of the importing root exists.
            EntityType::GlobalField => &["context_id"],
            _ => &[],
        }
    }

    /// Columns forced to a fixed value on load.
    pub fn override_columns(&self) -> &'static [Override] {
        match self {
            EntityType::Project => &[Override::ImportingUser("user_id")],
            EntityType::GlobalField | EntityType::Field => &[Override::ImportingUser("user_id")],
            EntityType::Note => &[Override::ImportingUser("created_by")],
            _ => &[],
        }
    }

    /// How rows of this entity are tied to a root project.
    pub fn scope(&self) -> Scope {
        match self {
            EntityType::Project => Scope::Root,
            EntityType::GlobalField => Scope::Referenced,
            EntityType::Context
            | EntityType::Field
            | EntityType::Template
            | EntityType::Note
            | EntityType::ProjectLink => Scope::Direct("project_id"),
            EntityType::FieldOption => Scope::Via {
                parent: EntityType::Field,
                column: "field_id",
            },
            EntityType::TemplateField | EntityType::Instance => Scope::Via {
                parent: EntityType::Template,
                column: "template_id",
            },
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A column referencing another entity's primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: &'static str,
    pub references: EntityType,
}

impl ForeignKey {
    pub const fn new(column: &'static str, references: EntityType) -> Self {
        Self { column, references }
    }
}

const CONTEXT_KEYS: &[ForeignKey] = &[ForeignKey::new("project_id", EntityType::Project)];
const FIELD_KEYS: &[ForeignKey] = &[
    ForeignKey::new("project_id", EntityType::Project),
    ForeignKey::new("context_id", EntityType::Context),
];
const FIELD_OPTION_KEYS: &[ForeignKey] = &[ForeignKey::new("field_id", EntityType::Field)];
const TEMPLATE_KEYS: &[ForeignKey] = &[
    ForeignKey::new("project_id", EntityType::Project),
    ForeignKey::new("context_id", EntityType::Context),
];
const TEMPLATE_FIELD_KEYS: &[ForeignKey] = &[
    ForeignKey::new("template_id", EntityType::Template),
    ForeignKey::new("field_id", EntityType::Field),
];
const INSTANCE_KEYS: &[ForeignKey] = &[ForeignKey::new("template_id", EntityType::Template)];
const NOTE_KEYS: &[ForeignKey] = &[
    ForeignKey::new("project_id", EntityType::Project),
    ForeignKey::new("instance_id", EntityType::Instance),
];
const PROJECT_LINK_KEYS: &[ForeignKey] = &[
    ForeignKey::new("project_id", EntityType::Project),
    ForeignKey::new("linked_project_id", EntityType::Project),
];

/// A column whose dump value is replaced on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Override {
    /// Set to the id of the user the import runs for.
    ImportingUser(&'static str),
}

impl Override {
    pub fn column(&self) -> &'static str {
        match self {
            Override::ImportingUser(column) => column,
        }
    }
}

/// Relationship between an entity's rows and the root project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The root itself.
    Root,
    /// Has a column pointing straight at the root.
    Direct(&'static str),
    /// Belongs to the root through one parent entity that is itself `Direct`.
    Via {
        parent: EntityType,
        column: &'static str,
    },
    /// Not owned by any root; loaded only when referenced.
    Referenced,
}

/// Global insert order. Every entity appears after the entities it references,
/// apart from the project-to-project link which is resolved separately.
pub const INSERT_ORDER: &[EntityType] = &[
    EntityType::Project,
    EntityType::GlobalField,
    EntityType::Context,
    EntityType::Field,
    EntityType::FieldOption,
    EntityType::Template,
    EntityType::TemplateField,
    EntityType::Instance,
    EntityType::Note,
    EntityType::ProjectLink,
];

/// Entity types counted per root, i.e. everything owned by a project including itself.
pub fn root_owned() -> impl Iterator<Item = EntityType> {
    INSERT_ORDER
        .iter()
        .copied()
        .filter(|e| !matches!(e.scope(), Scope::Referenced))
}

/// Entities deleted explicitly before their root, because a RESTRICT
/// reference into the same subtree would block the cascade.
pub const DELETE_BEFORE_ROOT: &[EntityType] = &[EntityType::Note];

/// Column on `projects` that must stay unique per user.
pub const ROOT_LABEL_COLUMN: &str = "label";

/// Column on `projects` marking soft deletion.
pub const ROOT_DELETED_COLUMN: &str = "deleted_at";

/// Column holding the rich-text document on templates.
pub const TEMPLATE_BODY_COLUMN: &str = "body";
