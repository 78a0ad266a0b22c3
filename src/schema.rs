//! Converges note types toward a desired definition.
//!
//! Reconciliation only ever appends fields and templates or overwrites matching ones.
//! Nothing is removed or reordered: note content is mapped to fields by position, so a
//! destructive edit would silently corrupt existing notes.

use crate::{Collection, CollectionError, NoteType, Result};
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateDefinition {
    pub name: String,
    pub qfmt: String,
    pub afmt: String,
}

/// Desired shape of a note type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteTypeDefinition {
    pub name: String,
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub css: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub templates: Option<Vec<TemplateDefinition>>,
}

impl NoteTypeDefinition {
    /// Parses `{"name", "fields", "css"?, "templates"?}`
    ///
    /// # Errors
    ///
    /// `InvalidDefinition` if the JSON is malformed, lacks `name` or `fields`, or fails
    /// [`NoteTypeDefinition::validate`]
    pub fn from_json(json: &str) -> Result<Self> {
        let definition: Self = serde_json::from_str(json)
            .map_err(|e| CollectionError::InvalidDefinition(e.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    /// Checks that every name in the definition is usable
    ///
    /// # Errors
    ///
    /// `InvalidDefinition` for an empty note type, field or template name
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CollectionError::InvalidDefinition(
                "note type name is empty".to_string(),
            ));
        }
        if self.fields.iter().any(|f| f.trim().is_empty()) {
            return Err(CollectionError::InvalidDefinition(format!(
                "note type '{}' has an empty field name",
                self.name
            )));
        }
        if self.templates.iter().flatten().any(|t| t.name.trim().is_empty()) {
            return Err(CollectionError::InvalidDefinition(format!(
                "note type '{}' has an empty template name",
                self.name
            )));
        }
        Ok(())
    }
}

/// Applies `definition` to `notetype` in memory and reports whether anything changed.
///
/// * missing fields are appended in definition order
/// * `css` is overwritten when given and different
/// * missing templates are appended, templates with a matching name get their formats
///   overwritten when either differs
///
/// Fields and templates the definition does not mention are left alone.
pub fn reconcile(notetype: &mut NoteType, definition: &NoteTypeDefinition) -> bool {
    let mut changed = false;

    for name in &definition.fields {
        if notetype.field_index(name).is_none() {
            trace!("Adding field '{name}' to '{}'", notetype.name);
            notetype.add_field(name);
            changed = true;
        }
    }

    if let Some(css) = &definition.css {
        if *css != notetype.css {
            notetype.css.clone_from(css);
            changed = true;
        }
    }

    for desired in definition.templates.iter().flatten() {
        match notetype.template_mut(&desired.name) {
            Some(existing) => {
                if existing.qfmt != desired.qfmt || existing.afmt != desired.afmt {
                    trace!("Updating template '{}'", desired.name);
                    existing.qfmt.clone_from(&desired.qfmt);
                    existing.afmt.clone_from(&desired.afmt);
                    changed = true;
                }
            }
            None => {
                trace!("Adding template '{}' to '{}'", desired.name, notetype.name);
                notetype.add_template(&desired.name, &desired.qfmt, &desired.afmt);
                changed = true;
            }
        }
    }

    changed
}

/// Creates the note type if no note type has that name, otherwise reconciles the
/// existing one and saves it only if something changed. Returns the note type id.
///
/// # Errors
///
/// `InvalidDefinition` if the definition fails validation, or a store error
pub fn ensure_schema(col: &Collection, definition: &NoteTypeDefinition) -> Result<i64> {
    definition.validate()?;

    if let Some(mut existing) = col.notetype_by_name(&definition.name)? {
        if reconcile(&mut existing, definition) {
            col.update_notetype(&mut existing)?;
            info!("Updated note type '{}'", existing.name);
        } else {
            debug!("Note type '{}' is up to date", existing.name);
        }
        return Ok(existing.id);
    }

    let mut notetype = NoteType::new(&definition.name);
    reconcile(&mut notetype, definition);
    let id = col.add_notetype(&mut notetype)?;
    info!("Created note type '{}' with ID: {id}", notetype.name);
    Ok(id)
}

/// Every note type with its field, template and note counts
///
/// # Errors
///
/// Returns an error if the store query fails
pub fn list_notetypes(col: &Collection) -> Result<Vec<crate::NoteTypeSummary>> {
    col.notetypes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SqliteStore;
    use crate::backends::recording::RecordingStore;
    use tempfile::{TempDir, tempdir};

    fn collection() -> (TempDir, Collection) {
        let dir = tempdir().unwrap();
        let col = Collection::create(dir.path().join("collection.db")).unwrap();
        (dir, col)
    }

    fn basic(fields: &[&str]) -> NoteTypeDefinition {
        NoteTypeDefinition {
            name: "Basic".to_string(),
            fields: fields.iter().map(ToString::to_string).collect(),
            css: None,
            templates: Some(vec![TemplateDefinition {
                name: "Card 1".to_string(),
                qfmt: "{{Front}}".to_string(),
                afmt: "{{Back}}".to_string(),
            }]),
        }
    }

    fn field_names(nt: &NoteType) -> Vec<&str> {
        nt.field_names().collect()
    }

    #[test]
    fn parses_definition_json() {
        let def = NoteTypeDefinition::from_json(
            r#"{"name":"Basic","fields":["Front","Back"],"css":".card {}",
                "templates":[{"name":"Card 1","qfmt":"{{Front}}","afmt":"{{Back}}"}]}"#,
        )
        .unwrap();
        assert_eq!(def.fields, ["Front", "Back"]);
        assert_eq!(def.css.as_deref(), Some(".card {}"));
        assert_eq!(def.templates.unwrap()[0].name, "Card 1");
    }

    #[test]
    fn rejects_malformed_definitions() {
        for json in [
            r#"{"fields":["Front"]}"#,
            r#"{"name":"Basic"}"#,
            r#"{"name":"  ","fields":["Front"]}"#,
            r#"{"name":"Basic","fields":[""]}"#,
            r#"{"name":"Basic","fields":[],"templates":[{"name":"","qfmt":"","afmt":""}]}"#,
            "not json",
        ] {
            let err = NoteTypeDefinition::from_json(json).unwrap_err();
            assert!(
                matches!(err, CollectionError::InvalidDefinition(_)),
                "{json} gave {err:?}"
            );
        }
    }

    #[test]
    fn reconcile_is_idempotent() {
        let def = basic(&["Front", "Back"]);
        let mut nt = NoteType::new("Basic");
        assert!(reconcile(&mut nt, &def));
        let snapshot = nt.clone();

        assert!(!reconcile(&mut nt, &def));
        assert_eq!(nt, snapshot);
    }

    #[test]
    fn reconcile_only_appends_and_keeps_unmentioned_elements() {
        let mut nt = NoteType::new("Basic");
        nt.add_field("Back");
        nt.add_field("Notes");
        nt.add_template("Reverse", "{{Back}}", "{{Front}}");
        nt.css = ".custom {}".to_string();

        let changed = reconcile(&mut nt, &basic(&["Front", "Back", "Extra"]));

        assert!(changed);
        assert_eq!(field_names(&nt), ["Back", "Notes", "Front", "Extra"]);
        let templates: Vec<_> = nt.templates.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(templates, ["Reverse", "Card 1"]);
        assert_eq!(nt.css, ".custom {}");
    }

    #[test]
    fn reconcile_overwrites_changed_formats_and_css() {
        let mut nt = NoteType::new("Basic");
        reconcile(&mut nt, &basic(&["Front", "Back"]));

        let mut def = basic(&["Front", "Back"]);
        def.css = Some(".card { color: red }".to_string());
        def.templates.as_mut().unwrap()[0].afmt = "{{FrontSide}}<hr>{{Back}}".to_string();

        assert!(reconcile(&mut nt, &def));
        assert_eq!(nt.css, ".card { color: red }");
        assert_eq!(nt.templates.len(), 1);
        assert_eq!(nt.templates[0].afmt, "{{FrontSide}}<hr>{{Back}}");
        assert_eq!(nt.templates[0].qfmt, "{{Front}}");
    }

    #[test]
    fn duplicate_names_in_a_definition_collapse() {
        let mut def = basic(&["Front", "Front", "Back"]);
        def.templates.as_mut().unwrap().push(TemplateDefinition {
            name: "Card 1".to_string(),
            qfmt: "{{Back}}".to_string(),
            afmt: "{{Front}}".to_string(),
        });
        let mut nt = NoteType::new("Basic");
        reconcile(&mut nt, &def);

        assert_eq!(field_names(&nt), ["Front", "Back"]);
        assert_eq!(nt.templates.len(), 1);
        assert_eq!(nt.templates[0].qfmt, "{{Back}}");
    }

    #[test]
    fn ensure_schema_creates_then_reuses() {
        let (_dir, col) = collection();
        let def = basic(&["Front", "Back"]);

        let id = ensure_schema(&col, &def).unwrap();
        let first = col.notetype_by_id(id).unwrap().unwrap();

        assert_eq!(ensure_schema(&col, &def).unwrap(), id);
        let second = col.notetype_by_id(id).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(col.notetypes().unwrap().len(), 1);
    }

    #[test]
    fn unchanged_definition_writes_nothing() {
        let dir = tempdir().unwrap();
        let inner = SqliteStore::create(&dir.path().join("collection.db")).unwrap();
        let (store, calls) = RecordingStore::new(inner);
        let col = Collection::from_store(Box::new(store));
        let def = basic(&["Front", "Back"]);

        ensure_schema(&col, &def).unwrap();
        assert_eq!(*calls.borrow(), ["notetype_by_name", "add_notetype"]);

        calls.borrow_mut().clear();
        ensure_schema(&col, &def).unwrap();
        assert_eq!(*calls.borrow(), ["notetype_by_name"]);

        calls.borrow_mut().clear();
        ensure_schema(&col, &basic(&["Front", "Back", "Extra"])).unwrap();
        assert_eq!(*calls.borrow(), ["notetype_by_name", "update_notetype"]);
        col.close().unwrap();
    }

    #[test]
    fn ensure_schema_grows_existing_notetype() {
        let (_dir, col) = collection();
        let id = ensure_schema(&col, &basic(&["Front", "Back"])).unwrap();

        let again = ensure_schema(&col, &basic(&["Front", "Back", "Extra"])).unwrap();
        assert_eq!(again, id);

        let nt = col.notetype_by_id(id).unwrap().unwrap();
        assert_eq!(field_names(&nt), ["Front", "Back", "Extra"]);
        assert_eq!(nt.templates.len(), 1);
        assert_eq!(nt.templates[0].name, "Card 1");
        assert_eq!(nt.templates[0].qfmt, "{{Front}}");
        assert_eq!(nt.templates[0].afmt, "{{Back}}");
    }

    #[test]
    fn ensure_schema_without_templates_keeps_existing_ones() {
        let (_dir, col) = collection();
        let id = ensure_schema(&col, &basic(&["Front", "Back"])).unwrap();

        let mut bare = basic(&["Front"]);
        bare.templates = None;
        ensure_schema(&col, &bare).unwrap();

        let nt = col.notetype_by_id(id).unwrap().unwrap();
        assert_eq!(field_names(&nt), ["Front", "Back"]);
        assert_eq!(nt.templates.len(), 1);
    }
}
