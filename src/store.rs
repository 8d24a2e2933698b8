//! The symbolic instance store.
//!
//! Every SSA value the interpreter touches is bound to an *instance*: an
//! abstract handle for a runtime value, distinct from the SSA value itself.
//! Instances live in an arena keyed by stable integer IDs, and every aggregate
//! slot table stores IDs rather than references, so rebinding a value or
//! overwriting a slot never invalidates anything.
//!
//! Shape tables (array/slice element slots, struct field slots, map entries)
//! also live in slabs here.  A frame or the heap scope maps an instance to a
//! table handle; passing an aggregate across a call copies the handle, which
//! is exactly the share-by-reference aliasing the analysis needs: a slot
//! update in the callee is observed by the caller.  [`Store::update_instances`]
//! restores slot consistency after a store through a pointer by sweeping every
//! array and struct table.

use crate::ssa::{Pos, TypeId, ValueId};
use fnv::FnvHashMap;

/// Stable handle of an instance in the arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct InstanceId(pub u32);

/// Handle of an array/slice element table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ElemsId(pub u32);

/// Handle of a struct field table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FieldsId(pub u32);

/// Handle of a map entry table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MapId(pub u32);

/// Handle of a registered channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ChanId(pub u32);

/// Array and slice element slots, keyed by the SSA value used as the index.
pub type Elems = FnvHashMap<ValueId, InstanceId>;

/// Struct field slots, keyed by field position, sized by the declared count.
pub type Fields = Vec<Option<InstanceId>>;

/// Map entries, key instance to value instance.
pub type MapEntries = FnvHashMap<InstanceId, InstanceId>;

/// Instance variants.
#[derive(Clone, Debug)]
pub enum Instance {
    /// A freshly allocated symbolic value: originating SSA value, per-function
    /// serial number, and the index of the enclosing loop iteration.
    Concrete { value: ValueId, id: u32, loop_index: i64 },
    /// Wraps an SSA constant.
    Const { value: ValueId },
    /// Placeholder for a value returned from a function without a body; only
    /// its declared type is known.
    External { value: ValueId },
}

impl Instance {
    pub fn value(&self) -> ValueId {
        match *self {
            Instance::Concrete { value, .. }
            | Instance::Const { value }
            | Instance::External { value } => value,
        }
    }
}

/// A channel known to the analysis: fabricated unique name, element type,
/// buffer size, creation position, and the role it belongs to.
#[derive(Clone, Debug)]
pub struct Channel {
    pub name: String,
    pub elem: TypeId,
    pub size: i64,
    pub pos: Pos,
    pub role: String,
    /// Fabricated for a body-less callee returning a channel.
    pub external: bool,
}

/// Arena of instances, shape tables and the channel registry.
#[derive(Debug, Default)]
pub struct Store {
    instances: Vec<Instance>,
    elems: Vec<Elems>,
    fields: Vec<Fields>,
    maps: Vec<MapEntries>,
    channels: Vec<Channel>,
    chan_of: FnvHashMap<InstanceId, ChanId>,
}

impl Store {
    pub fn new() -> Store {
        Store::default()
    }

    fn push(&mut self, inst: Instance) -> InstanceId {
        let id = InstanceId(self.instances.len() as u32);
        self.instances.push(inst);
        id
    }

    /// A new concrete instance; `serial` is the caller frame's per-function
    /// counter.
    pub fn fresh(&mut self, value: ValueId, serial: u32, loop_index: i64) -> InstanceId {
        self.push(Instance::Concrete { value, id: serial, loop_index })
    }

    pub fn fresh_const(&mut self, value: ValueId) -> InstanceId {
        self.push(Instance::Const { value })
    }

    pub fn fresh_external(&mut self, value: ValueId) -> InstanceId {
        self.push(Instance::External { value })
    }

    pub fn instance(&self, id: InstanceId) -> &Instance {
        &self.instances[id.0 as usize]
    }

    /// The SSA value an instance originates from.
    pub fn value_of(&self, id: InstanceId) -> ValueId {
        self.instances[id.0 as usize].value()
    }

    pub fn is_external(&self, id: InstanceId) -> bool {
        matches!(self.instances[id.0 as usize], Instance::External { .. })
    }

    pub fn is_const(&self, id: InstanceId) -> bool {
        matches!(self.instances[id.0 as usize], Instance::Const { .. })
    }

    // Shape table slabs.

    pub fn new_elems(&mut self) -> ElemsId {
        let id = ElemsId(self.elems.len() as u32);
        self.elems.push(Elems::default());
        id
    }

    pub fn elems(&self, id: ElemsId) -> &Elems {
        &self.elems[id.0 as usize]
    }

    pub fn elems_mut(&mut self, id: ElemsId) -> &mut Elems {
        &mut self.elems[id.0 as usize]
    }

    pub fn new_fields(&mut self, count: usize) -> FieldsId {
        let id = FieldsId(self.fields.len() as u32);
        self.fields.push(vec![None; count]);
        id
    }

    pub fn fields(&self, id: FieldsId) -> &Fields {
        &self.fields[id.0 as usize]
    }

    pub fn fields_mut(&mut self, id: FieldsId) -> &mut Fields {
        &mut self.fields[id.0 as usize]
    }

    pub fn new_map(&mut self) -> MapId {
        let id = MapId(self.maps.len() as u32);
        self.maps.push(MapEntries::default());
        id
    }

    pub fn map_mut(&mut self, id: MapId) -> &mut MapEntries {
        &mut self.maps[id.0 as usize]
    }

    /// Replaces `old` with `new` in every array slot and struct field of every
    /// scope.  Invoked when a `Store` rebinds a value that aggregates may
    /// still reference.
    pub fn update_instances(&mut self, old: InstanceId, new: InstanceId) {
        for table in &mut self.elems {
            for slot in table.values_mut() {
                if *slot == old {
                    *slot = new;
                }
            }
        }
        for table in &mut self.fields {
            for slot in table.iter_mut() {
                if *slot == Some(old) {
                    *slot = Some(new);
                }
            }
        }
    }

    // Channel registry.

    /// Registers a channel for an instance; the fabricated name is unique and
    /// stable for the lifetime of the analysis.
    pub fn register_chan(
        &mut self,
        inst: InstanceId,
        elem: TypeId,
        size: i64,
        pos: Pos,
        role: &str,
        external: bool,
    ) -> ChanId {
        let id = ChanId(self.channels.len() as u32);
        self.channels.push(Channel {
            name: format!("ch{}", self.channels.len()),
            elem,
            size,
            pos,
            role: role.to_owned(),
            external,
        });
        self.chan_of.insert(inst, id);
        id
    }

    pub fn chan_of(&self, inst: InstanceId) -> Option<ChanId> {
        self.chan_of.get(&inst).copied()
    }

    pub fn channel(&self, id: ChanId) -> &Channel {
        &self.channels[id.0 as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::{Pos, TypeId, ValueId};

    #[test]
    fn fresh_instances_are_distinct() {
        let mut s = Store::new();
        let a = s.fresh(ValueId(0), 0, -1);
        let b = s.fresh(ValueId(0), 1, -1);
        assert_ne!(a, b);
        assert_eq!(s.value_of(a), s.value_of(b));
    }

    #[test]
    fn update_instances_sweeps_all_tables() {
        let mut s = Store::new();
        let old = s.fresh(ValueId(0), 0, -1);
        let new = s.fresh(ValueId(1), 1, -1);
        let other = s.fresh(ValueId(2), 2, -1);

        let arr = s.new_elems();
        s.elems_mut(arr).insert(ValueId(9), old);
        s.elems_mut(arr).insert(ValueId(10), other);
        let st = s.new_fields(2);
        s.fields_mut(st)[1] = Some(old);

        s.update_instances(old, new);
        assert_eq!(s.elems(arr)[&ValueId(9)], new);
        assert_eq!(s.elems(arr)[&ValueId(10)], other);
        assert_eq!(s.fields(st)[1], Some(new));
        assert_eq!(s.fields(st)[0], None);
    }

    #[test]
    fn channel_names_are_sequential() {
        let mut s = Store::new();
        let a = s.fresh(ValueId(0), 0, -1);
        let b = s.fresh(ValueId(1), 1, -1);
        let ca = s.register_chan(a, TypeId(0), 0, Pos::NONE, "main", false);
        let cb = s.register_chan(b, TypeId(0), 1, Pos::NONE, "main", false);
        assert_eq!(s.channel(ca).name, "ch0");
        assert_eq!(s.channel(cb).name, "ch1");
        assert_eq!(s.chan_of(a), Some(ca));
        assert_eq!(s.chan_of(b), Some(cb));
    }
}
