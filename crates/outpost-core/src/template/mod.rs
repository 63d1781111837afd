//! Template Versions - Deterministic A/B variant selection for campaign sends

mod selector;

pub use selector::{
    hash_to_bucket, select_template_version, AbShare, SelectedVersion, Template, TemplateVersion,
};
