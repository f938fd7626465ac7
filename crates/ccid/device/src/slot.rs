//! Per-slot card tracking

use bytes::Bytes;
use pcsclike_ccid::SlotStatus;
use tracing::trace;

/// Live connection to the card in a slot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Channel {
    atr: Bytes,
}

impl Channel {
    /// Answer-to-reset of the powered card, empty when no card is powered
    pub fn atr(&self) -> &Bytes {
        &self.atr
    }
}

/// One card accepting position of the reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    index: u8,
    name: String,
    card_present: bool,
    card_powered: bool,
    card_connected: bool,
    card_error: bool,
    channel: Channel,
}

impl Slot {
    /// An empty slot
    pub fn new(index: u8, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            card_present: false,
            card_powered: false,
            card_connected: false,
            card_error: false,
            channel: Channel::default(),
        }
    }

    /// Slot number
    pub const fn index(&self) -> u8 {
        self.index
    }

    /// Name reported by the reader
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A card sits in the slot
    pub const fn card_present(&self) -> bool {
        self.card_present
    }

    /// The card is powered according to the last status
    pub const fn card_powered(&self) -> bool {
        self.card_powered
    }

    /// The card is powered and its ATR is known
    pub const fn card_connected(&self) -> bool {
        self.card_connected
    }

    /// The last command on this slot failed
    pub const fn card_error(&self) -> bool {
        self.card_error
    }

    /// Card channel
    pub const fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Apply the slot status byte of a response
    ///
    /// Losing the card or its power drops the connection; a removed card also clears the error.
    pub(crate) fn apply_status(&mut self, status: SlotStatus) {
        self.card_present = status.card_present();
        self.card_powered = status.card_powered();
        if !self.card_powered {
            self.disconnect();
        }
        if !self.card_present {
            self.card_error = false;
        }
        trace!(
            slot = self.index,
            present = self.card_present,
            powered = self.card_powered,
            "slot status"
        );
    }

    /// Apply a presence change from a slot change notification
    ///
    /// Any change means another card, so a previous card error no longer applies.
    pub(crate) fn apply_presence(&mut self, present: bool) {
        self.card_present = present;
        self.card_error = false;
        if !present {
            self.card_powered = false;
            self.disconnect();
        }
    }

    pub(crate) fn connect(&mut self, atr: Bytes) {
        self.card_powered = true;
        self.card_connected = true;
        self.card_error = false;
        self.channel.atr = atr;
    }

    pub(crate) fn disconnect(&mut self) {
        self.card_connected = false;
        self.channel.atr = Bytes::new();
    }

    /// Flag the card as failing; an empty slot has no card to flag
    pub(crate) fn set_error(&mut self) {
        if self.card_present {
            self.card_error = true;
        }
    }

    pub(crate) fn rename(&mut self, name: String) {
        self.name = name;
    }
}

/// Slots of one device, indexed by slot number
#[derive(Debug, Clone, Default)]
pub struct SlotRegistry {
    slots: Vec<Slot>,
}

impl SlotRegistry {
    /// Registry with `count` unnamed slots
    pub fn with_count(count: u8) -> Self {
        Self {
            slots: (0..count).map(|index| Slot::new(index, "")).collect(),
        }
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// No slot known yet
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot by number
    pub fn get(&self, index: u8) -> Option<&Slot> {
        self.slots.get(index as usize)
    }

    /// All slots in order
    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    pub(crate) fn get_mut(&mut self, index: u8) -> Option<&mut Slot> {
        self.slots.get_mut(index as usize)
    }

    /// Name slot `index`, appending it when it is the next one
    ///
    /// Returns `false` when `index` would leave a gap.
    pub(crate) fn set_name(&mut self, index: u8, name: String) -> bool {
        let at = index as usize;
        if at < self.slots.len() {
            self.slots[at].rename(name);
            true
        } else if at == self.slots.len() {
            self.slots.push(Slot::new(index, name));
            true
        } else {
            false
        }
    }

    /// A card is present in `index`
    pub fn check_presence(&self, index: u8) -> bool {
        self.get(index).is_some_and(Slot::card_present)
    }

    /// The card in `index` is connected
    pub fn is_connected(&self, index: u8) -> bool {
        self.get(index).is_some_and(Slot::card_connected)
    }

    /// ATR of the card in `index`
    pub fn atr(&self, index: u8) -> Option<Bytes> {
        self.get(index)
            .filter(|slot| slot.card_connected)
            .map(|slot| slot.channel.atr.clone())
    }
}
