// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Application-facing entity traits and handles.
//!
//! An application type implements [`Entity`] by describing its columns in
//! [`Entity::define`] and converting itself to and from a flat value list.
//! The engine never reflects over the type; all layout comes from the
//! definition.
//!
//! ```rust,ignore
//! #[derive(Debug, Clone, Default)]
//! struct User { id: u64, name: String, age: u16, meta: EntityMeta }
//!
//! impl Entity for User {
//!     fn entity_name() -> &'static str { "User" }
//!     fn define(def: &mut EntityDefinition) {
//!         def.redis_cache("default").local_cache("default");
//!         def.field("Name", FieldKind::String).required().length(64).unique("Name");
//!         def.field("Age", FieldKind::UInt16);
//!     }
//!     fn id(&self) -> u64 { self.id }
//!     fn set_id(&mut self, id: u64) { self.id = id }
//!     fn meta(&self) -> &EntityMeta { &self.meta }
//!     fn meta_mut(&mut self) -> &mut EntityMeta { &mut self.meta }
//!     fn to_values(&self) -> Vec<Value> { vec![self.name.as_str().into(), self.age.into()] }
//!     fn from_values(id: u64, r: &mut ValueReader) -> Result<Self, OrmError> {
//!         Ok(User { id, name: r.string()?, age: r.u16()?, meta: EntityMeta::default() })
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::definition::EntityDefinition;
use super::value::{Reference, Value, ValueReader};
use crate::error::OrmError;

pub trait Entity: fmt::Debug + Clone + Send + Sync + 'static {
    /// Registry name; also the default table name.
    fn entity_name() -> &'static str;

    fn define(def: &mut EntityDefinition);

    fn id(&self) -> u64;

    fn set_id(&mut self, id: u64);

    fn meta(&self) -> &EntityMeta;

    fn meta_mut(&mut self) -> &mut EntityMeta;

    /// Non-ID column values in declaration order.
    fn to_values(&self) -> Vec<Value>;

    fn from_values(id: u64, values: &mut ValueReader) -> Result<Self, OrmError>;
}

/// Engine-owned state carried inside every entity.
///
/// Holds the binary image of the row as last seen in storage; the flusher
/// diffs against it. Never part of equality.
#[derive(Clone, Default)]
pub struct EntityMeta {
    pub(crate) image: Option<Arc<[u8]>>,
}

impl EntityMeta {
    /// Whether the entity was loaded from (or already written to) storage.
    pub fn is_loaded(&self) -> bool {
        self.image.is_some()
    }
}

impl fmt::Debug for EntityMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityMeta")
            .field("image_len", &self.image.as_ref().map(|i| i.len()))
            .finish()
    }
}

impl PartialEq for EntityMeta {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

/// Type-erased view of a tracked entity, used by the flusher and by
/// pending references.
pub trait TrackedRecord: Send + Sync {
    fn entity_name(&self) -> &'static str;

    fn id(&self) -> u64;

    fn set_id(&self, id: u64);

    fn values(&self) -> Vec<Value>;

    fn image(&self) -> Option<Arc<[u8]>>;

    /// Replace the entity with the persisted row and remember its image.
    fn reload(&self, id: u64, values: Vec<Value>, image: Arc<[u8]>) -> Result<(), OrmError>;

    fn forget_image(&self);
}

struct TrackedCell<E> {
    entity: RwLock<E>,
}

impl<E: Entity> TrackedRecord for TrackedCell<E> {
    fn entity_name(&self) -> &'static str {
        E::entity_name()
    }

    fn id(&self) -> u64 {
        self.entity.read().id()
    }

    fn set_id(&self, id: u64) {
        self.entity.write().set_id(id);
    }

    fn values(&self) -> Vec<Value> {
        self.entity.read().to_values()
    }

    fn image(&self) -> Option<Arc<[u8]>> {
        self.entity.read().meta().image.clone()
    }

    fn reload(&self, id: u64, values: Vec<Value>, image: Arc<[u8]>) -> Result<(), OrmError> {
        let mut fresh = E::from_values(id, &mut ValueReader::new(E::entity_name(), values))?;
        fresh.set_id(id);
        fresh.meta_mut().image = Some(image);
        *self.entity.write() = fresh;
        Ok(())
    }

    fn forget_image(&self) {
        self.entity.write().meta_mut().image = None;
    }
}

/// Shared handle to an entity inside a context's tracked set.
///
/// Cloning the handle does not clone the entity; all clones observe the
/// id assigned on insert and the state reloaded after flush.
pub struct Tracked<E: Entity> {
    cell: Arc<TrackedCell<E>>,
}

impl<E: Entity> Tracked<E> {
    pub(crate) fn new(entity: E) -> Self {
        Self {
            cell: Arc::new(TrackedCell {
                entity: RwLock::new(entity),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.cell.entity.read().id()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, E> {
        self.cell.entity.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, E> {
        self.cell.entity.write()
    }

    /// Owned copy of the current state.
    pub fn get(&self) -> E {
        self.cell.entity.read().clone()
    }

    pub fn ptr_eq(&self, other: &Tracked<E>) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    pub(crate) fn record(&self) -> Arc<dyn TrackedRecord> {
        self.cell.clone()
    }
}

impl<E: Entity> Clone for Tracked<E> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<E: Entity> fmt::Debug for Tracked<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Tracked").field(&*self.read()).finish()
    }
}

/// Reference column value: either a bare id or a tracked entity that may
/// still be waiting for its id.
pub enum Ref<E: Entity> {
    Id(u64),
    Tracked(Tracked<E>),
}

impl<E: Entity> Ref<E> {
    pub fn id(&self) -> u64 {
        match self {
            Ref::Id(id) => *id,
            Ref::Tracked(t) => t.id(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Ref::Id(id) => Value::reference(*id),
            Ref::Tracked(t) => match t.id() {
                0 => Value::Ref(Reference::Pending(t.record())),
                id => Value::reference(id),
            },
        }
    }
}

impl<E: Entity> From<u64> for Ref<E> {
    fn from(id: u64) -> Self {
        Ref::Id(id)
    }
}

impl<E: Entity> From<Tracked<E>> for Ref<E> {
    fn from(t: Tracked<E>) -> Self {
        Ref::Tracked(t)
    }
}

impl<E: Entity> From<&Tracked<E>> for Ref<E> {
    fn from(t: &Tracked<E>) -> Self {
        Ref::Tracked(t.clone())
    }
}

impl<E: Entity> Clone for Ref<E> {
    fn clone(&self) -> Self {
        match self {
            Ref::Id(id) => Ref::Id(*id),
            Ref::Tracked(t) => Ref::Tracked(t.clone()),
        }
    }
}

impl<E: Entity> PartialEq for Ref<E> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Ref::Tracked(a), Ref::Tracked(b)) if a.ptr_eq(b) => true,
            _ => self.id() != 0 && self.id() == other.id(),
        }
    }
}

impl<E: Entity> fmt::Debug for Ref<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref<{}>({})", E::entity_name(), self.id())
    }
}
