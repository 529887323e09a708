//! Network-toggled consensus values (sporks).
//!
//! Spork dissemination is the peer layer's job; the core only consumes the
//! current values. Time-valued sporks are active once their value is in the
//! past; numeric sporks are read directly.

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SporkId {
    MasternodeWinnerEnforcement,
    PaymentEnforcementDosValue,
    PaymentEnforcementThreshold,
}

impl SporkId {
    pub fn wire_id(self) -> i32 {
        match self {
            Self::MasternodeWinnerEnforcement => 10_002,
            Self::PaymentEnforcementDosValue => 10_004,
            Self::PaymentEnforcementThreshold => 10_012,
        }
    }

    pub fn from_wire_id(id: i32) -> Option<Self> {
        match id {
            10_002 => Some(Self::MasternodeWinnerEnforcement),
            10_004 => Some(Self::PaymentEnforcementDosValue),
            10_012 => Some(Self::PaymentEnforcementThreshold),
            _ => None,
        }
    }

    fn default_value(self) -> i64 {
        match self {
            // A timestamp in the future leaves winner enforcement off.
            Self::MasternodeWinnerEnforcement => 4_070_908_800,
            Self::PaymentEnforcementDosValue => 10,
            Self::PaymentEnforcementThreshold => 5,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SporkSet {
    winner_enforcement: i64,
    dos_value: i64,
    threshold: i64,
}

impl Default for SporkSet {
    fn default() -> Self {
        Self {
            winner_enforcement: SporkId::MasternodeWinnerEnforcement.default_value(),
            dos_value: SporkId::PaymentEnforcementDosValue.default_value(),
            threshold: SporkId::PaymentEnforcementThreshold.default_value(),
        }
    }
}

impl SporkSet {
    pub fn value(&self, id: SporkId) -> i64 {
        match id {
            SporkId::MasternodeWinnerEnforcement => self.winner_enforcement,
            SporkId::PaymentEnforcementDosValue => self.dos_value,
            SporkId::PaymentEnforcementThreshold => self.threshold,
        }
    }

    pub fn set_value(&mut self, id: SporkId, value: i64) {
        match id {
            SporkId::MasternodeWinnerEnforcement => self.winner_enforcement = value,
            SporkId::PaymentEnforcementDosValue => self.dos_value = value,
            SporkId::PaymentEnforcementThreshold => self.threshold = value,
        }
    }

    /// Time-valued sporks activate once their value is in the past.
    pub fn is_active(&self, id: SporkId, now: i64) -> bool {
        self.value(id) < now
    }
}
