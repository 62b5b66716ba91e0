//! Slot state machine: `Empty` ⇄ `Bound(blob_id)`.

use uuid::Uuid;

use attache_core::AttachmentSlot;

/// In-memory view of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    #[default]
    Empty,
    Bound(Uuid),
}

impl SlotState {
    pub fn blob_id(&self) -> Option<Uuid> {
        match self {
            SlotState::Empty => None,
            SlotState::Bound(id) => Some(*id),
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, SlotState::Bound(_))
    }

    /// Bind `blob_id`. Re-binding the bound blob is a no-op transition.
    pub fn attach(self, blob_id: Uuid) -> Transition {
        Transition {
            from: self,
            to: SlotState::Bound(blob_id),
        }
    }

    pub fn detach(self) -> Transition {
        Transition {
            from: self,
            to: SlotState::Empty,
        }
    }
}

impl From<Option<Uuid>> for SlotState {
    fn from(blob_id: Option<Uuid>) -> Self {
        blob_id.map_or(SlotState::Empty, SlotState::Bound)
    }
}

impl From<Option<&AttachmentSlot>> for SlotState {
    fn from(row: Option<&AttachmentSlot>) -> Self {
        row.map(|r| r.blob_id).into()
    }
}

/// A state change, before it is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SlotState,
    pub to: SlotState,
}

impl Transition {
    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }

    /// Blob that loses its binding through this transition.
    pub fn released(&self) -> Option<Uuid> {
        match (self.from, self.to) {
            (SlotState::Bound(old), SlotState::Bound(new)) if old == new => None,
            (SlotState::Bound(old), _) => Some(old),
            (SlotState::Empty, _) => None,
        }
    }
}
