//! Shared version-component type for the two independent, differently-tagged
//! comparators in `skills.rs` and `self_update.rs`. See the doc comments on
//! `skills::marketplace_version_key` and `self_update::self_update_version_key`
//! for why there are two and why they aren't unified.

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum VersionComponent {
    Num(i64),
    Str(String),
}
