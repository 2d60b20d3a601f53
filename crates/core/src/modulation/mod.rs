//! Routing of named values from modulation sources to target slots.
//!
//! A [`Source`] owns named values; a [`Target`] owns named slots with default
//! values. Connecting binds one source property to one target slot and pushes
//! the current value immediately; every later [`Source::set`] pushes to all
//! bound slots before returning. A slot accepts at most one source at a time.
//!
//! Both sides keep bookkeeping for every connection so that tearing down
//! either side leaves no dangling entries on the other. Handles are cheap
//! clones of a shared node and are confined to one thread.

mod transform;

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

pub use transform::{apply_chain, Transform};

const DEFAULT_SOURCE_LABEL: &str = "Unnamed Source";
const DEFAULT_TARGET_LABEL: &str = "Unnamed Target";

type Value = Box<dyn Any>;
type Convert = fn(&dyn Any, &[Transform]) -> Option<Value>;

/// Typed name of a modulation property.
///
/// Connecting requires both keys to carry the same value type.
pub struct ModKey<T> {
    name: &'static str,
    _value: PhantomData<fn() -> T>,
}

impl<T> ModKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _value: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for ModKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ModKey<T> {}

impl<T> fmt::Debug for ModKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModKey({})", self.name)
    }
}

fn convert_plain<T: Clone + 'static>(value: &dyn Any, _: &[Transform]) -> Option<Value> {
    value
        .downcast_ref::<T>()
        .map(|value| Box::new(value.clone()) as Value)
}

fn convert_scalar(value: &dyn Any, transforms: &[Transform]) -> Option<Value> {
    value
        .downcast_ref::<f64>()
        .map(|&value| Box::new(apply_chain(transforms, value)) as Value)
}

struct Slot {
    value: Value,
    type_id: TypeId,
}

impl Slot {
    fn new<T: 'static>(value: T) -> Self {
        Self {
            value: Box::new(value),
            type_id: TypeId::of::<T>(),
        }
    }

    fn holds<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

struct Binding {
    target: Weak<RefCell<TargetNode>>,
    source_key: &'static str,
    target_key: &'static str,
    transforms: Vec<Transform>,
    convert: Convert,
}

impl Binding {
    fn drives(&self, target: &Target) -> bool {
        self.target.as_ptr() == Rc::as_ptr(&target.node)
    }
}

struct SourceNode {
    label: String,
    properties: BTreeMap<&'static str, Slot>,
    bindings: Vec<Binding>,
}

struct BoundSource {
    source: Weak<RefCell<SourceNode>>,
    source_key: &'static str,
}

struct TargetSlot {
    slot: Slot,
    bound: Option<BoundSource>,
}

impl TargetSlot {
    fn is_bound(&self) -> bool {
        self.bound
            .as_ref()
            .is_some_and(|bound| bound.source.strong_count() > 0)
    }
}

struct TargetNode {
    label: String,
    slots: BTreeMap<&'static str, TargetSlot>,
    version: u64,
}

impl TargetNode {
    fn write(&mut self, key: &'static str, value: Value) {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.slot.value = value;
            self.version += 1;
        }
    }

    fn unbind(&mut self, key: &'static str) {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.bound = None;
        }
    }
}

/// Producer side of the graph.
#[derive(Clone)]
pub struct Source {
    node: Rc<RefCell<SourceNode>>,
}

impl Source {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            node: Rc::new(RefCell::new(SourceNode {
                label: label.into(),
                properties: BTreeMap::new(),
                bindings: Vec::new(),
            })),
        }
    }

    /// Adds a property with its initial value.
    pub fn with_property<T: Clone + 'static>(self, key: ModKey<T>, initial: T) -> Self {
        self.node
            .borrow_mut()
            .properties
            .insert(key.name, Slot::new(initial));
        self
    }

    pub fn label(&self) -> String {
        self.node.borrow().label.clone()
    }

    pub fn set_label(&self, label: impl Into<String>) {
        self.node.borrow_mut().label = label.into();
    }

    pub fn get<T: Clone + 'static>(&self, key: ModKey<T>) -> Option<T> {
        let node = self.node.borrow();
        node.properties
            .get(key.name)
            .and_then(|slot| slot.value.downcast_ref::<T>())
            .cloned()
    }

    /// Updates a property and pushes it to every bound target slot.
    ///
    /// Returns false if the property does not exist with this type.
    pub fn set<T: Clone + 'static>(&self, key: ModKey<T>, value: T) -> bool {
        {
            let mut node = self.node.borrow_mut();
            match node.properties.get_mut(key.name) {
                Some(slot) if slot.holds::<T>() => slot.value = Box::new(value),
                _ => return false,
            }
        }
        self.push(key.name);
        true
    }

    /// Binds `source_key` to the target's `target_key` slot.
    ///
    /// Fails without side effects if the slot is already driven by a source,
    /// or if either property is missing or holds another type.
    pub fn connect<T: Clone + 'static>(
        &self,
        target: &impl Modulatable,
        source_key: ModKey<T>,
        target_key: ModKey<T>,
    ) -> bool {
        self.bind(
            target.modulation(),
            source_key.name,
            target_key.name,
            TypeId::of::<T>(),
            Vec::new(),
            convert_plain::<T>,
        )
    }

    /// Like [`Source::connect`], reshaping the value through `transforms`.
    pub fn connect_with(
        &self,
        target: &impl Modulatable,
        source_key: ModKey<f64>,
        target_key: ModKey<f64>,
        transforms: Vec<Transform>,
    ) -> bool {
        self.bind(
            target.modulation(),
            source_key.name,
            target_key.name,
            TypeId::of::<f64>(),
            transforms,
            convert_scalar,
        )
    }

    /// Replaces the transform chain of an existing binding and re-pushes.
    pub fn set_transforms(
        &self,
        target: &impl Modulatable,
        source_key: ModKey<f64>,
        target_key: ModKey<f64>,
        transforms: Vec<Transform>,
    ) -> bool {
        let target = target.modulation();
        let update = {
            let mut node = self.node.borrow_mut();
            let SourceNode {
                properties,
                bindings,
                ..
            } = &mut *node;
            let Some(binding) = bindings.iter_mut().find(|binding| {
                binding.drives(target)
                    && binding.source_key == source_key.name
                    && binding.target_key == target_key.name
            }) else {
                return false;
            };
            binding.transforms = transforms;
            binding.convert = convert_scalar;
            properties
                .get(source_key.name)
                .and_then(|slot| convert_scalar(slot.value.as_ref(), &binding.transforms))
        };
        if let Some(value) = update {
            target.node.borrow_mut().write(target_key.name, value);
        }
        true
    }

    /// Removes one binding.
    pub fn disconnect<T>(
        &self,
        target: &impl Modulatable,
        source_key: ModKey<T>,
        target_key: ModKey<T>,
    ) {
        let target = target.modulation();
        let removed = self.remove_bindings(|binding| {
            binding.drives(target)
                && binding.source_key == source_key.name
                && binding.target_key == target_key.name
        });
        let mut node = target.node.borrow_mut();
        for binding in removed {
            node.unbind(binding.target_key);
        }
    }

    /// Removes every binding into `target`.
    pub fn disconnect_target(&self, target: &impl Modulatable) {
        let target = target.modulation();
        let removed = self.remove_bindings(|binding| binding.drives(target));
        let mut node = target.node.borrow_mut();
        for binding in removed {
            node.unbind(binding.target_key);
        }
    }

    /// Removes every binding of this source.
    pub fn disconnect_all(&self) {
        let removed = self.remove_bindings(|_| true);
        for binding in removed {
            if let Some(target) = binding.target.upgrade() {
                target.borrow_mut().unbind(binding.target_key);
            }
        }
    }

    pub fn destroy(&self) {
        self.disconnect_all();
    }

    /// Targets currently driven by `key`, with the slot name on each.
    pub fn connected_targets<T>(&self, key: ModKey<T>) -> Vec<(Target, &'static str)> {
        self.node
            .borrow()
            .bindings
            .iter()
            .filter(|binding| binding.source_key == key.name)
            .filter_map(|binding| {
                let node = binding.target.upgrade()?;
                Some((Target { node }, binding.target_key))
            })
            .collect()
    }

    fn bind(
        &self,
        target: &Target,
        source_key: &'static str,
        target_key: &'static str,
        type_id: TypeId,
        transforms: Vec<Transform>,
        convert: Convert,
    ) -> bool {
        let initial = {
            let node = self.node.borrow();
            match node.properties.get(source_key) {
                Some(slot) if slot.type_id == type_id => {
                    convert(slot.value.as_ref(), &transforms)
                }
                _ => None,
            }
        };
        let Some(initial) = initial else {
            return false;
        };
        {
            let mut node = target.node.borrow_mut();
            let Some(slot) = node.slots.get_mut(target_key) else {
                return false;
            };
            if slot.is_bound() || slot.slot.type_id != type_id {
                return false;
            }
            slot.bound = Some(BoundSource {
                source: Rc::downgrade(&self.node),
                source_key,
            });
            node.write(target_key, initial);
        }
        self.node.borrow_mut().bindings.push(Binding {
            target: Rc::downgrade(&target.node),
            source_key,
            target_key,
            transforms,
            convert,
        });
        tracing::trace!(source_key, target_key, "modulation connected");
        true
    }

    fn push(&self, key: &'static str) {
        let mut stale = false;
        let updates: Vec<_> = {
            let node = self.node.borrow();
            let Some(slot) = node.properties.get(key) else {
                return;
            };
            node.bindings
                .iter()
                .filter(|binding| binding.source_key == key)
                .filter_map(|binding| {
                    let value = (binding.convert)(slot.value.as_ref(), &binding.transforms)?;
                    Some((binding.target.clone(), binding.target_key, value))
                })
                .collect()
        };
        for (target, target_key, value) in updates {
            match target.upgrade() {
                Some(target) => target.borrow_mut().write(target_key, value),
                None => stale = true,
            }
        }
        if stale {
            self.node
                .borrow_mut()
                .bindings
                .retain(|binding| binding.target.strong_count() > 0);
        }
    }

    fn remove_bindings(&self, mut remove: impl FnMut(&Binding) -> bool) -> Vec<Binding> {
        let mut node = self.node.borrow_mut();
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut node.bindings)
            .into_iter()
            .partition(|binding| remove(binding));
        node.bindings = kept;
        removed
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self.node.borrow();
        f.debug_struct("Source")
            .field("label", &node.label)
            .field("properties", &node.properties.keys().collect::<Vec<_>>())
            .field("bindings", &node.bindings.len())
            .finish()
    }
}

impl Default for Source {
    fn default() -> Self {
        Self::new(DEFAULT_SOURCE_LABEL)
    }
}

/// Consumer side of the graph.
#[derive(Clone)]
pub struct Target {
    node: Rc<RefCell<TargetNode>>,
}

impl Target {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            node: Rc::new(RefCell::new(TargetNode {
                label: label.into(),
                slots: BTreeMap::new(),
                version: 0,
            })),
        }
    }

    /// Adds a slot holding `default` until a source drives it.
    pub fn with_slot<T: Clone + 'static>(self, key: ModKey<T>, default: T) -> Self {
        self.node.borrow_mut().slots.insert(
            key.name,
            TargetSlot {
                slot: Slot::new(default),
                bound: None,
            },
        );
        self
    }

    pub fn label(&self) -> String {
        self.node.borrow().label.clone()
    }

    pub fn set_label(&self, label: impl Into<String>) {
        self.node.borrow_mut().label = label.into();
    }

    pub fn get<T: Clone + 'static>(&self, key: ModKey<T>) -> Option<T> {
        let node = self.node.borrow();
        node.slots
            .get(key.name)
            .and_then(|slot| slot.slot.value.downcast_ref::<T>())
            .cloned()
    }

    /// Incremented on every pushed value; compare against a saved copy to
    /// detect changes.
    pub fn version(&self) -> u64 {
        self.node.borrow().version
    }

    pub fn connected<T>(&self, key: ModKey<T>) -> bool {
        self.node
            .borrow()
            .slots
            .get(key.name)
            .is_some_and(TargetSlot::is_bound)
    }

    /// The source driving `key`, with the source property name.
    pub fn connected_source<T>(&self, key: ModKey<T>) -> Option<(Source, &'static str)> {
        let node = self.node.borrow();
        let bound = node.slots.get(key.name)?.bound.as_ref()?;
        let source = bound.source.upgrade()?;
        Some((Source { node: source }, bound.source_key))
    }

    /// Disconnects every source driving this target.
    pub fn destroy(&self) {
        let sources: Vec<Source> = {
            let mut node = self.node.borrow_mut();
            node.slots
                .values_mut()
                .filter_map(|slot| {
                    let bound = slot.bound.take()?;
                    bound.source.upgrade()
                })
                .map(|node| Source { node })
                .collect()
        };
        for source in sources {
            source.disconnect_target(self);
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self.node.borrow();
        f.debug_struct("Target")
            .field("label", &node.label)
            .field("slots", &node.slots.keys().collect::<Vec<_>>())
            .field("version", &node.version)
            .finish()
    }
}

impl Default for Target {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET_LABEL)
    }
}

/// Anything that exposes a modulation target.
pub trait Modulatable {
    fn modulation(&self) -> &Target;
}

impl Modulatable for Target {
    fn modulation(&self) -> &Target {
        self
    }
}
