/// Colour assignment for user avatars
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Fixed avatar palette, in allocation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserColor {
    Blue,
    Green,
    Red,
    Orange,
    Yellow,
    Olive,
    Teal,
    Violet,
    Purple,
    Pink,
    Brown,
}

impl UserColor {
    pub const PALETTE: [UserColor; 11] = [
        UserColor::Blue,
        UserColor::Green,
        UserColor::Red,
        UserColor::Orange,
        UserColor::Yellow,
        UserColor::Olive,
        UserColor::Teal,
        UserColor::Violet,
        UserColor::Purple,
        UserColor::Pink,
        UserColor::Brown,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            UserColor::Blue => "blue",
            UserColor::Green => "green",
            UserColor::Red => "red",
            UserColor::Orange => "orange",
            UserColor::Yellow => "yellow",
            UserColor::Olive => "olive",
            UserColor::Teal => "teal",
            UserColor::Violet => "violet",
            UserColor::Purple => "purple",
            UserColor::Pink => "pink",
            UserColor::Brown => "brown",
        }
    }

    /// Background class name, e.g. `bg-blue`
    pub fn class_name(&self) -> String {
        format!("bg-{}", self.name())
    }

    pub fn rgb(&self) -> (u8, u8, u8) {
        match self {
            UserColor::Blue => (0x21, 0x85, 0xd0),
            UserColor::Green => (0x21, 0xba, 0x45),
            UserColor::Red => (0xdb, 0x28, 0x28),
            UserColor::Orange => (0xf2, 0x71, 0x1c),
            UserColor::Yellow => (0xfb, 0xbd, 0x08),
            UserColor::Olive => (0xb5, 0xcc, 0x18),
            UserColor::Teal => (0x00, 0xb5, 0xad),
            UserColor::Violet => (0x64, 0x35, 0xc9),
            UserColor::Purple => (0xa3, 0x33, 0xc8),
            UserColor::Pink => (0xe0, 0x39, 0x97),
            UserColor::Brown => (0xa5, 0x67, 0x3f),
        }
    }

    /// Convert to hex color string
    pub fn to_hex(&self) -> String {
        let (r, g, b) = self.rgb();
        format!("#{:02X}{:02X}{:02X}", r, g, b)
    }
}

/// Hands out palette colours per user code.
///
/// A code keeps its colour for the lifetime of the assigner. Once every
/// palette slot is in use the used set is cleared and allocation starts over
/// from the first colour, so later users may share a colour with earlier ones.
#[derive(Debug, Clone, Default)]
pub struct ColorAssigner {
    assigned: HashMap<String, UserColor>,
    used: Vec<UserColor>,
}

impl ColorAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn color_for(&mut self, code: &str) -> UserColor {
        if let Some(color) = self.assigned.get(code) {
            return *color;
        }

        if self.used.len() == UserColor::PALETTE.len() {
            self.used.clear();
        }

        let color = UserColor::PALETTE
            .iter()
            .copied()
            .find(|c| !self.used.contains(c))
            .unwrap_or(UserColor::PALETTE[0]);

        self.used.push(color);
        self.assigned.insert(code.to_string(), color);
        color
    }

    /// Colour already given to `code`, without allocating
    pub fn get(&self, code: &str) -> Option<UserColor> {
        self.assigned.get(code).copied()
    }
}
