//! Change Set Computer: derive one entity's change set from its snapshot.

use crate::change_set::{ChangeSet, ChangeSetType};
use keel_core::snapshot::{self, Payload, PayloadValue};
use keel_core::{EntityRef, ReferenceKind, Result, ValidationError, ValidationErrorKind, Value};
use std::collections::HashSet;

/// Computes change sets and collects the collections that need synchronising.
#[derive(Debug, Default)]
pub struct ChangeSetComputer {
    collection_updates: Vec<(EntityRef, String)>,
    registered: HashSet<(EntityRef, String)>,
}

impl ChangeSetComputer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the change set for `entity`, or `None` if nothing is to be written.
    ///
    /// Creates run on-create initializers for empty fields first. Updates run
    /// on-update initializers only when another field already changed, so an
    /// update hook is never the sole cause of a write.
    #[tracing::instrument(
        level = "trace",
        skip(self, entity),
        fields(entity = %entity.entity_name())
    )]
    pub fn compute(&mut self, entity: &EntityRef) -> Result<Option<ChangeSet>> {
        let meta = entity.meta();
        if meta.read_only {
            return Ok(None);
        }

        let kind = if entity.has_original() {
            ChangeSetType::Update
        } else {
            ChangeSetType::Create
        };

        if kind == ChangeSetType::Create {
            for prop in &meta.properties {
                if let Some(init) = &prop.on_create {
                    if entity.get(&prop.name).is_none_or(|v| v.is_null()) {
                        entity.set_raw(&prop.name, init());
                    }
                }
            }
        }

        let original = entity.original_snapshot();
        let mut payload = match kind {
            ChangeSetType::Create => creatable(&meta, snapshot::prepare(entity)),
            _ => snapshot::diff(&meta, &snapshot::prepare(entity), original.as_ref()),
        };

        if kind == ChangeSetType::Update
            && payload.is_empty()
            && !entity.is_initialized()
            && !entity.is_touched()
        {
            return Ok(None);
        }

        for name in entity.dirty_collections() {
            let Some(prop) = meta.prop(&name) else {
                continue;
            };
            if prop.uses_pivot() && self.registered.insert((entity.clone(), name.clone())) {
                tracing::trace!(collection = %name, "Collection registered for synchronisation");
                self.collection_updates.push((entity.clone(), name));
            }
        }

        if kind == ChangeSetType::Update && !payload.is_empty() {
            let staged: Vec<(String, Value)> = meta
                .properties
                .iter()
                .filter(|p| !payload.contains_key(&p.name))
                .filter_map(|p| p.on_update.as_ref().map(|init| (p.name.clone(), init())))
                .collect();
            if !staged.is_empty() {
                for (name, value) in staged {
                    entity.set_raw(&name, value);
                }
                payload = snapshot::diff(&meta, &snapshot::prepare(entity), original.as_ref());
            }
        }

        if payload.is_empty() {
            return Ok(None);
        }

        validate(entity, kind, &payload)?;
        Ok(Some(ChangeSet::new(entity, kind, payload)))
    }

    /// Pivot collections registered during computation, in discovery order.
    pub fn take_collection_updates(&mut self) -> Vec<(EntityRef, String)> {
        self.registered.clear();
        std::mem::take(&mut self.collection_updates)
    }
}

/// Insertable fields: the prepared form minus empty generated keys.
fn creatable(meta: &keel_core::EntityMetadata, mut prepared: Payload) -> Payload {
    prepared.retain(|name, value| {
        let generated_key = meta
            .prop(name)
            .is_some_and(|p| p.primary && p.auto_increment);
        !(generated_key && value.as_value().is_some_and(Value::is_null))
    });
    prepared
}

fn validate(entity: &EntityRef, kind: ChangeSetType, payload: &Payload) -> Result<()> {
    let meta = entity.meta();
    for prop in meta.properties.iter().filter(|p| p.is_persisted()) {
        if prop.nullable || prop.kind == ReferenceKind::ManyToMany {
            continue;
        }
        let value = payload.get(&prop.name);
        let is_null = value
            .and_then(PayloadValue::as_value)
            .is_some_and(Value::is_null);
        let missing = match kind {
            ChangeSetType::Create => {
                !prop.is_generated() && prop.on_create.is_none() && (value.is_none() || is_null)
            }
            _ => is_null && !prop.is_generated(),
        };
        if missing {
            return Err(ValidationError::new(
                ValidationErrorKind::MissingValue,
                "value is required",
            )
            .entity(&meta.name)
            .property(&prop.name)
            .into());
        }
    }
    Ok(())
}
