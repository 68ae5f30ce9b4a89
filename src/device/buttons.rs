/// Logical ids of the physical controls (knobs first, then buttons)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ButtonId {
    KnobTopLeft,
    KnobCenterLeft,
    KnobBottomLeft,
    KnobTopRight,
    KnobCenterRight,
    KnobBottomRight,
    Button0,
    Button1,
    Button2,
    Button3,
    Button4,
    Button5,
    Button6,
    Button7,
}

/// Device key code → logical id, as reported in button and knob frames
pub const BUTTON_CODES: [(u8, ButtonId); 14] = [
    (0x01, ButtonId::KnobTopLeft),
    (0x02, ButtonId::KnobCenterLeft),
    (0x03, ButtonId::KnobBottomLeft),
    (0x04, ButtonId::KnobTopRight),
    (0x05, ButtonId::KnobCenterRight),
    (0x06, ButtonId::KnobBottomRight),
    (0x07, ButtonId::Button0),
    (0x08, ButtonId::Button1),
    (0x09, ButtonId::Button2),
    (0x0a, ButtonId::Button3),
    (0x0b, ButtonId::Button4),
    (0x0c, ButtonId::Button5),
    (0x0d, ButtonId::Button6),
    (0x0e, ButtonId::Button7),
];

/// Physical buttons in left-to-right order
pub const PHYSICAL_BUTTONS: [ButtonId; 8] = [
    ButtonId::Button0,
    ButtonId::Button1,
    ButtonId::Button2,
    ButtonId::Button3,
    ButtonId::Button4,
    ButtonId::Button5,
    ButtonId::Button6,
    ButtonId::Button7,
];

impl ButtonId {
    /// Look up the logical id for a device key code
    pub fn from_code(code: u8) -> Option<Self> {
        BUTTON_CODES
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, id)| *id)
    }

    /// Device key code used when addressing this control (e.g. SET_COLOR)
    pub fn key_code(self) -> u8 {
        BUTTON_CODES
            .iter()
            .find(|(_, id)| *id == self)
            .map(|(c, _)| *c)
            .unwrap_or_default()
    }

    pub fn is_knob(self) -> bool {
        self < ButtonId::Button0
    }
}
