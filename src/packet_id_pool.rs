use std::collections::HashSet;

use crate::packet::PacketId;

/// Hands out packet identifiers that are not currently in flight.
pub(crate) struct PacketIdPool {
    in_use: HashSet<u16>,
    next_id: u16,
}

impl Default for PacketIdPool {
    fn default() -> Self {
        Self {
            in_use: HashSet::new(),
            next_id: 1,
        }
    }
}

impl PacketIdPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_id(&mut self) -> Result<PacketId, crate::Error> {
        for _ in 0..u16::MAX {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);

            if self.next_id == 0 {
                self.next_id = 1;
            }

            if self.in_use.insert(id) {
                return PacketId::try_from(id);
            }
        }

        Err(crate::Error::NoPacketIdAvailable)
    }

    pub(crate) fn release(&mut self, id: PacketId) {
        self.in_use.remove(&id.get());
    }

    pub(crate) fn in_use(&self) -> usize {
        self.in_use.len()
    }

    /// Forgets every identifier and restarts numbering from 1.
    pub(crate) fn clear(&mut self) {
        self.in_use.clear();
        self.next_id = 1;
    }
}
