// MemCon data model (§3.5): slot/token/class identifiers.

/// Index of a slot within a channel's slot table, `0 .. NumSlots`.
pub type SlotIndex = u32;

/// A receiver's quota bucket. Distinct receivers can share a class; a slot
/// charged to a class counts once no matter how many receivers of that
/// class are currently holding it (§4.6.5).
pub type ClassId = u32;

/// An opaque handle a client holds while reading a slot. Resolves to a slot
/// index and the generation the slot had when the token was issued; stale
/// once the slot is recycled to a different generation (§3.5 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotToken {
    pub index: SlotIndex,
    pub generation: u32,
}

/// One receiver class's configured quota and live usage count.
#[derive(Debug, Clone, Copy)]
pub struct ReceiverClass {
    pub id: ClassId,
    pub max_slots_in_use: u32,
    pub slots_in_use: u32,
}

impl ReceiverClass {
    pub fn new(id: ClassId, max_slots_in_use: u32) -> Self {
        ReceiverClass { id, max_slots_in_use, slots_in_use: 0 }
    }

    pub fn has_quota(&self) -> bool {
        self.slots_in_use < self.max_slots_in_use
    }
}

/// Per-slot server-side bookkeeping: the generation a recycled slot has
/// moved to, and which classes currently hold a reference to it.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub generation: u32,
    /// `per_slot_class_refcount[class]` from §4.6.5, keyed by class id.
    pub class_refcount: std::collections::HashMap<ClassId, u32>,
}

impl SlotState {
    pub fn new() -> Self {
        SlotState { generation: 0, class_refcount: std::collections::HashMap::new() }
    }

    pub fn is_free(&self) -> bool {
        self.class_refcount.values().all(|&c| c == 0)
    }

    pub fn charge(&mut self, class: ClassId) {
        *self.class_refcount.entry(class).or_insert(0) += 1;
    }

    /// Discharge one reference; returns whether the slot became fully free
    /// as a result (the caller then bumps `generation`, §4.6.4 step 6).
    pub fn discharge(&mut self, class: ClassId) -> bool {
        if let Some(count) = self.class_refcount.get_mut(&class) {
            if *count > 0 {
                *count -= 1;
            }
        }
        self.is_free()
    }

    pub fn is_charged_to(&self, class: ClassId) -> bool {
        self.class_refcount.get(&class).copied().unwrap_or(0) > 0
    }
}

impl Default for SlotState {
    fn default() -> Self {
        Self::new()
    }
}
