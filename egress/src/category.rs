//! The packet `Category` taxonomy and the fixed priority/parent-throttle table from spec.md §3.

/// Logical class of an outgoing packet. Closed enumeration — there is no "unknown" variant by
/// design; an unmapped category can only arise from a bug upstream, which `Category::try_from_u8`
/// reports as `None` rather than panicking.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Category {
    Wind = 0,
    Cloud = 1,
    Land = 2,
    Texture = 3,
    Asset = 4,
    Task = 5,
    Transfer = 6,
    State = 7,
    AvatarInfo = 8,
    Resend = 9,
    OutBand = 10,
}

impl Category {
    pub const ALL: [Category; 11] = [
        Category::Wind,
        Category::Cloud,
        Category::Land,
        Category::Texture,
        Category::Asset,
        Category::Task,
        Category::Transfer,
        Category::State,
        Category::AvatarInfo,
        Category::Resend,
        Category::OutBand,
    ];

    /// Fixed default priority, 0 (lowest) to 7 (highest). `Resend` and `OutBand` share the top
    /// priority; `Transfer` and `State` share priority 5 (spec.md §9, preserved intentionally).
    #[inline]
    pub fn priority(self) -> u8 {
        match self {
            Category::Wind | Category::Cloud => 0,
            Category::Land => 1,
            Category::Texture => 2,
            Category::Asset => 3,
            Category::Task => 4,
            Category::Transfer | Category::State => 5,
            Category::AvatarInfo => 6,
            Category::Resend | Category::OutBand => 7,
        }
    }

    /// The category this one's token bucket is a child of, if any. `None` means "client root".
    /// `OutBand` has no bucket at all — it bypasses throttling entirely (see
    /// `Category::bypasses_throttle`).
    #[inline]
    pub fn parent(self) -> Option<Category> {
        match self {
            Category::Transfer => Some(Category::Asset),
            Category::State => Some(Category::Task),
            Category::AvatarInfo => Some(Category::State),
            Category::OutBand => None,
            _ => None,
        }
    }

    /// `OutBand` packets never touch a token bucket; `dequeue_outgoing` submits them to the send
    /// sink unconditionally.
    #[inline]
    pub fn bypasses_throttle(self) -> bool {
        matches!(self, Category::OutBand)
    }
}

/// An outgoing packet, opaque to the core beyond these three fields. Owned by whoever enqueued
/// it until it is handed to the send sink or dropped at shutdown.
#[derive(Debug, Clone)]
pub struct OutgoingPacket {
    pub category: Category,
    pub payload_len: u32,
    pub buffer: Vec<u8>,
}

impl OutgoingPacket {
    pub fn new(category: Category, buffer: Vec<u8>) -> OutgoingPacket {
        OutgoingPacket {
            category,
            payload_len: buffer.len() as u32,
            buffer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_table_matches_spec() {
        assert_eq!(Category::Wind.priority(), 0);
        assert_eq!(Category::Cloud.priority(), 0);
        assert_eq!(Category::Land.priority(), 1);
        assert_eq!(Category::Texture.priority(), 2);
        assert_eq!(Category::Asset.priority(), 3);
        assert_eq!(Category::Task.priority(), 4);
        assert_eq!(Category::Transfer.priority(), 5);
        assert_eq!(Category::State.priority(), 5);
        assert_eq!(Category::AvatarInfo.priority(), 6);
        assert_eq!(Category::Resend.priority(), 7);
        assert_eq!(Category::OutBand.priority(), 7);
    }

    #[test]
    fn parent_chain_is_a_forest() {
        assert_eq!(Category::Transfer.parent(), Some(Category::Asset));
        assert_eq!(Category::State.parent(), Some(Category::Task));
        assert_eq!(Category::AvatarInfo.parent(), Some(Category::State));
        assert_eq!(Category::Wind.parent(), None);
        assert_eq!(Category::Resend.parent(), None);
    }

    #[test]
    fn outband_bypasses_throttle_only() {
        assert!(Category::OutBand.bypasses_throttle());
        assert!(!Category::Resend.bypasses_throttle());
    }
}
