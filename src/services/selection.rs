//! Turns a [`Selection`] into the concrete archive entries to install, and
//! rebuilds selections for records that predate structured selections.

use indexmap::IndexMap;
use std::collections::{BTreeSet, HashSet};
use thiserror::Error;

use crate::models::{
    ArchiveLayout, Backend, DEFAULT_OPTION_LABEL, DirectLooseLayout, EntryPair, ManifestLayout,
    Selection,
};

use super::classifier::{is_loose_payload, is_yumia_payload};

pub const COMMON_ONLY_SUMMARY: &str = "(common files only)";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("option {0:?} does not exist in this archive")]
    UnknownOption(String),

    #[error("feature {0:?} does not exist in this archive")]
    UnknownFeature(String),

    #[error("choice {choice:?} does not exist for feature {feature:?}")]
    UnknownChoice { feature: String, choice: String },

    #[error("feature {0:?} is required")]
    MissingRequiredFeature(String),

    #[error("a {selection} selection does not apply to a {layout} archive")]
    WrongShape {
        selection: &'static str,
        layout: &'static str,
    },

    #[error("the selection contains no files to install")]
    Empty,
}

/// A validated selection with the entries it expands to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSelection {
    /// Canonical form of the selection (manifest features in manifest order).
    pub selection: Selection,
    pub summary: String,
    /// Unique by archive path, in install order.
    pub entries: Vec<EntryPair>,
}

impl ResolvedSelection {
    pub fn contains_loose_payloads(&self) -> bool {
        self.entries.iter().any(|e| is_loose_payload(&e.archive_path))
    }

    pub fn contains_yumia_payloads(&self) -> bool {
        self.entries.iter().any(|e| is_yumia_payload(&e.archive_path))
    }

    /// Backend the selected files need when installed as-is.
    pub fn native_backend(&self) -> Backend {
        if self.contains_yumia_payloads() {
            Backend::Yumia
        } else {
            Backend::Loose
        }
    }
}

fn selection_shape(selection: &Selection) -> &'static str {
    match selection {
        Selection::Variant { .. } => "variant",
        Selection::Components { .. } => "components",
        Selection::Features { .. } => "features",
    }
}

pub fn resolve(
    layout: &ArchiveLayout,
    selection: &Selection,
) -> Result<ResolvedSelection, SelectionError> {
    let resolved = match (layout, selection) {
        (ArchiveLayout::LegacyYumia(options), Selection::Variant { name }) => {
            let option = options
                .iter()
                .find(|o| &o.label == name)
                .or_else(|| (options.len() == 1).then(|| &options[0]))
                .ok_or_else(|| SelectionError::UnknownOption(name.clone()))?;
            ResolvedSelection {
                selection: Selection::variant(option.label.clone()),
                summary: option.label.clone(),
                entries: dedupe_by_archive_path(option.files.iter().cloned()),
            }
        }
        (ArchiveLayout::DirectLoose(layout), Selection::Variant { name }) if !layout.multi_select => {
            let option = layout
                .components
                .iter()
                .find(|o| &o.label == name)
                .or_else(|| layout.components.first().filter(|_| name == DEFAULT_OPTION_LABEL))
                .ok_or_else(|| SelectionError::UnknownOption(name.clone()))?;
            ResolvedSelection {
                selection: Selection::variant(option.label.clone()),
                summary: option.label.clone(),
                entries: dedupe_by_archive_path(
                    layout.common.iter().cloned().chain(option.files.iter().cloned()),
                ),
            }
        }
        (ArchiveLayout::DirectLoose(layout), Selection::Components { names }) => {
            resolve_components(layout, names)?
        }
        (ArchiveLayout::Manifest(layout), Selection::Features { choices }) => {
            resolve_features(layout, choices)?
        }
        (layout, selection) => {
            return Err(SelectionError::WrongShape {
                selection: selection_shape(selection),
                layout: layout.kind_name(),
            });
        }
    };

    if resolved.entries.is_empty() {
        return Err(SelectionError::Empty);
    }
    Ok(resolved)
}

fn resolve_components(
    layout: &DirectLooseLayout,
    names: &[String],
) -> Result<ResolvedSelection, SelectionError> {
    let requested: BTreeSet<&str> = names.iter().map(String::as_str).collect();
    for name in &requested {
        if !layout.components.iter().any(|c| c.label == *name) {
            return Err(SelectionError::UnknownOption(name.to_string()));
        }
    }

    // Keep component order, not request order.
    let chosen: Vec<_> = layout
        .components
        .iter()
        .filter(|c| requested.contains(c.label.as_str()))
        .collect();

    let entries = dedupe_by_archive_path(
        layout
            .common
            .iter()
            .cloned()
            .chain(chosen.iter().flat_map(|c| c.files.iter().cloned())),
    );
    let labels: Vec<String> = chosen.iter().map(|c| c.label.clone()).collect();

    Ok(ResolvedSelection {
        summary: components_summary(!layout.common.is_empty(), &labels),
        selection: Selection::Components { names: labels },
        entries,
    })
}

fn resolve_features(
    layout: &ManifestLayout,
    requested: &IndexMap<String, Option<String>>,
) -> Result<ResolvedSelection, SelectionError> {
    for name in requested.keys() {
        if layout.feature(name).is_none() {
            return Err(SelectionError::UnknownFeature(name.clone()));
        }
    }

    let mut choices = IndexMap::new();
    let mut files: Vec<EntryPair> = layout
        .common
        .iter()
        .flat_map(|c| c.files.iter().cloned())
        .collect();

    for feature in &layout.features {
        let choice = requested.get(&feature.name).cloned().flatten();
        match choice {
            None if feature.optional => {
                choices.insert(feature.name.clone(), None);
            }
            None => return Err(SelectionError::MissingRequiredFeature(feature.name.clone())),
            Some(label) => {
                let option = feature.choice(&label).ok_or_else(|| SelectionError::UnknownChoice {
                    feature: feature.name.clone(),
                    choice: label.clone(),
                })?;
                files.extend(option.files.iter().cloned());
                choices.insert(feature.name.clone(), Some(label));
            }
        }
    }

    // Later sources win a destination, so a feature file overrides a common one.
    let mut by_destination: IndexMap<String, EntryPair> = IndexMap::new();
    for pair in files {
        by_destination.shift_remove(&pair.install_path.to_lowercase());
        by_destination.insert(pair.install_path.to_lowercase(), pair);
    }

    Ok(ResolvedSelection {
        summary: features_summary(&choices),
        selection: Selection::Features { choices },
        entries: by_destination.into_values().collect(),
    })
}

fn dedupe_by_archive_path(pairs: impl IntoIterator<Item = EntryPair>) -> Vec<EntryPair> {
    let mut seen = HashSet::new();
    pairs
        .into_iter()
        .filter(|pair| seen.insert(pair.archive_path.clone()))
        .collect()
}

/// `"Common + A; B"`, `"A; B"` or [`COMMON_ONLY_SUMMARY`].
pub fn components_summary(has_common: bool, labels: &[String]) -> String {
    match (has_common, labels.is_empty()) {
        (_, true) => COMMON_ONLY_SUMMARY.to_string(),
        (true, false) => format!("Common + {}", labels.join("; ")),
        (false, false) => labels.join("; "),
    }
}

/// `"Feature: Option; Other: Choice"`, skipped optional features omitted.
pub fn features_summary(choices: &IndexMap<String, Option<String>>) -> String {
    let parts: Vec<String> = choices
        .iter()
        .filter_map(|(feature, choice)| choice.as_ref().map(|c| format!("{feature}: {c}")))
        .collect();
    if parts.is_empty() {
        COMMON_ONLY_SUMMARY.to_string()
    } else {
        parts.join("; ")
    }
}

/// Rebuild a selection from a legacy `option_name` and its installed files.
///
/// Manifest archives are tried through the `"Feature: Option; ..."` summary
/// first and then through matching the installed files against each choice.
pub fn reconstruct(
    layout: &ArchiveLayout,
    option_name: &str,
    package_files: &[String],
) -> Option<Selection> {
    match layout {
        ArchiveLayout::LegacyYumia(options) => options
            .iter()
            .find(|o| o.label == option_name)
            .or_else(|| (options.len() == 1).then(|| &options[0]))
            .map(|o| Selection::variant(o.label.clone())),
        ArchiveLayout::DirectLoose(layout) if !layout.multi_select => layout
            .components
            .first()
            .map(|o| Selection::variant(o.label.clone())),
        ArchiveLayout::DirectLoose(layout) => {
            let stripped = option_name.strip_prefix("Common + ").unwrap_or(option_name);
            let names: Vec<String> = stripped
                .split("; ")
                .filter(|n| layout.components.iter().any(|c| c.label == *n))
                .map(str::to_string)
                .collect();
            Some(Selection::Components { names })
        }
        ArchiveLayout::Manifest(layout) => parse_features_summary(layout, option_name)
            .or_else(|| infer_features(layout, package_files))
            .map(|choices| Selection::Features { choices }),
    }
}

fn parse_features_summary(
    layout: &ManifestLayout,
    summary: &str,
) -> Option<IndexMap<String, Option<String>>> {
    let mut parsed = IndexMap::new();
    if summary != COMMON_ONLY_SUMMARY {
        for part in summary.split("; ") {
            let (feature, choice) = part.split_once(": ")?;
            layout.feature(feature)?.choice(choice)?;
            parsed.insert(feature.to_string(), choice.to_string());
        }
    }

    let mut choices = IndexMap::new();
    for feature in &layout.features {
        match parsed.shift_remove(&feature.name) {
            Some(choice) => {
                choices.insert(feature.name.clone(), Some(choice));
            }
            None if feature.optional => {
                choices.insert(feature.name.clone(), None);
            }
            None => return None,
        }
    }
    Some(choices)
}

/// Pick, per feature, the single choice whose install paths are all present.
fn infer_features(
    layout: &ManifestLayout,
    package_files: &[String],
) -> Option<IndexMap<String, Option<String>>> {
    let installed: HashSet<String> = package_files.iter().map(|f| f.to_lowercase()).collect();
    let mut choices = IndexMap::new();

    for feature in &layout.features {
        let matching: Vec<&str> = feature
            .choices
            .iter()
            .filter(|choice| {
                !choice.files.is_empty()
                    && choice
                        .files
                        .iter()
                        .filter(|f| is_yumia_payload(&f.install_path))
                        .all(|f| installed.contains(&f.install_path.to_lowercase()))
            })
            .map(|choice| choice.label.as_str())
            .collect();

        match matching.as_slice() {
            [only] => {
                choices.insert(feature.name.clone(), Some(only.to_string()));
            }
            [] if feature.optional => {
                choices.insert(feature.name.clone(), None);
            }
            _ => return None,
        }
    }
    Some(choices)
}
