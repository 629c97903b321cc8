//! Block configuration items and the built-in default table

use serde::{Deserialize, Serialize};

/// Maximum number of option names on an options item
pub const CONFIG_MAX_OPTIONS: usize = 16;

/// Protocol identifier of a configuration item (0-127)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigId(pub u8);

impl ConfigId {
    // MIDI
    pub const MIDI_START_CHANNEL: Self = Self(0);
    pub const MIDI_END_CHANNEL: Self = Self(1);
    pub const MIDI_USE_MPE: Self = Self(2);
    pub const PITCH_BEND_RANGE: Self = Self(3);
    pub const OCTAVE: Self = Self(4);
    pub const TRANSPOSE: Self = Self(5);
    pub const SLIDE_CC: Self = Self(6);
    pub const SLIDE_MODE: Self = Self(7);
    pub const OCTAVE_TOPOLOGY: Self = Self(8);
    pub const MIDI_CHANNEL_RANGE: Self = Self(9);
    pub const MPE_ZONE: Self = Self(40);
    // Touch
    pub const VELOCITY_SENSITIVITY: Self = Self(10);
    pub const GLIDE_SENSITIVITY: Self = Self(11);
    pub const SLIDE_SENSITIVITY: Self = Self(12);
    pub const PRESSURE_SENSITIVITY: Self = Self(13);
    pub const LIFT_SENSITIVITY: Self = Self(14);
    pub const FIXED_VELOCITY: Self = Self(15);
    pub const FIXED_VELOCITY_VALUE: Self = Self(16);
    pub const PIANO_MODE: Self = Self(17);
    pub const GLIDE_LOCK: Self = Self(18);
    pub const GLIDE_LOCK_ENABLE: Self = Self(19);
    // Live
    pub const MODE: Self = Self(20);
    pub const VOLUME: Self = Self(21);
    pub const SCALE: Self = Self(22);
    pub const HIDE_MODE: Self = Self(23);
    pub const CHORD: Self = Self(24);
    pub const ARP_PATTERN: Self = Self(25);
    pub const TEMPO: Self = Self(26);
    pub const KEY: Self = Self(27);
    pub const AUTO_TRANSPOSE_TO_KEY: Self = Self(28);
    // Tracking
    pub const X_TRACKING_MODE: Self = Self(30);
    pub const Y_TRACKING_MODE: Self = Self(31);
    pub const Z_TRACKING_MODE: Self = Self(32);
    // Graphics
    pub const GAMMA_CORRECTION: Self = Self(33);
    pub const GLOBAL_KEY_COLOUR: Self = Self(34);
    pub const ROOT_KEY_COLOUR: Self = Self(35);
    pub const BRIGHTNESS: Self = Self(36);
    // User slots
    pub const USER_FIRST: Self = Self(64);
    pub const USER_LAST: Self = Self(95);
    /// First id of the per-mode groups; each mode has [`MODE_ITEM_COUNT`] items
    pub const MODE_FIRST: Self = Self(100);

    /// Id of the `n`th user slot (0-31)
    pub fn user(n: u8) -> Self {
        Self(Self::USER_FIRST.0 + n.min(31))
    }

    /// Id of an item within one of the four per-mode groups
    pub fn mode_item(mode: u8, item: ModeItem) -> Self {
        Self(Self::MODE_FIRST.0 + mode.min(3) * MODE_ITEM_COUNT + item as u8)
    }

    pub fn is_user(self) -> bool {
        (Self::USER_FIRST.0..=Self::USER_LAST.0).contains(&self.0)
    }
}

impl std::fmt::Display for ConfigId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Items in each per-mode group, in id order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeItem {
    ColorType = 0,
    MidiMode = 1,
    PitchEnable = 2,
    PressureEnable = 3,
    ShowScale = 4,
    GlobalColour = 5,
    RootColour = 6,
}

pub const MODE_ITEM_COUNT: u8 = 7;

/// How a configuration value should be presented
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    #[default]
    Integer,
    Boolean,
    Options,
    Colour,
}

/// A configuration entry with its bounds and presentation metadata
///
/// `min <= value <= max` is only a display hint. The value echoed back by the
/// block is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigItem {
    pub id: ConfigId,
    pub value: i32,
    pub min: i32,
    pub max: i32,
    /// Set once the block has confirmed the item
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config_type: ConfigType,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub group: Option<String>,
}

impl ConfigItem {
    /// An entry with no metadata, as created for ids missing from the table
    pub fn bare(id: ConfigId) -> Self {
        Self {
            id,
            value: 0,
            min: 0,
            max: 0,
            active: false,
            name: None,
            config_type: ConfigType::Integer,
            options: Vec::new(),
            group: None,
        }
    }

    pub fn option_name(&self, index: usize) -> Option<&str> {
        self.options.get(index).map(String::as_str)
    }
}

pub const MIDI_SETTINGS_GROUP: &str = "MIDI Settings";
pub const PITCH_GROUP: &str = "Pitch";
pub const PLAY_GROUP: &str = "Play mode";
pub const SENSITIVITY_GROUP: &str = "Sensitivity";
pub const RHYTHM_GROUP: &str = "Rhythm";
pub const COLOURS_GROUP: &str = "Colors";
pub const MODE_GROUPS: [&str; 4] = ["Mode 1", "Mode 2", "Mode 3", "Mode 4"];

fn item(
    id: ConfigId,
    (value, min, max): (i32, i32, i32),
    name: &str,
    config_type: ConfigType,
    options: &[&str],
    group: &str,
) -> ConfigItem {
    debug_assert!(options.len() <= CONFIG_MAX_OPTIONS);
    ConfigItem {
        id,
        value,
        min,
        max,
        active: false,
        name: Some(name.to_string()),
        config_type,
        options: options.iter().map(|o| o.to_string()).collect(),
        group: Some(group.to_string()),
    }
}

fn integer(id: ConfigId, range: (i32, i32, i32), name: &str, group: &str) -> ConfigItem {
    item(id, range, name, ConfigType::Integer, &[], group)
}

fn boolean(id: ConfigId, value: i32, name: &str, group: &str) -> ConfigItem {
    item(id, (value, 0, 1), name, ConfigType::Boolean, &[], group)
}

fn options(id: ConfigId, range: (i32, i32, i32), name: &str, names: &[&str], group: &str) -> ConfigItem {
    item(id, range, name, ConfigType::Options, names, group)
}

fn colour(id: ConfigId, name: &str, group: &str) -> ConfigItem {
    item(id, (i32::MIN, i32::MIN, i32::MAX), name, ConfigType::Colour, &[], group)
}

/// The items every block starts out with before the device reports its own
pub fn default_config() -> Vec<ConfigItem> {
    const TRACKING: [&str; 5] = ["Multi-Channel", "Last Played", "Highest", "Lowest", "Disabled"];
    const KEYS: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];

    let mut items = vec![
        integer(ConfigId::MIDI_START_CHANNEL, (2, 1, 16), "MIDI Start Channel", MIDI_SETTINGS_GROUP),
        integer(ConfigId::MIDI_END_CHANNEL, (16, 1, 16), "MIDI End Channel", MIDI_SETTINGS_GROUP),
        options(
            ConfigId::MIDI_USE_MPE,
            (1, 0, 2),
            "MIDI Mode",
            &["Multi Channel", "MPE", "Single Channel"],
            MIDI_SETTINGS_GROUP,
        ),
        integer(ConfigId::PITCH_BEND_RANGE, (48, 1, 96), "Pitch Bend Range", MIDI_SETTINGS_GROUP),
        integer(ConfigId::MIDI_CHANNEL_RANGE, (15, 1, 15), "No. MIDI Channels", MIDI_SETTINGS_GROUP),
        options(ConfigId::MPE_ZONE, (0, 0, 1), "MPE Zone", &["Lower Zone", "Upper Zone"], MIDI_SETTINGS_GROUP),
        integer(ConfigId::OCTAVE, (0, -4, 6), "Octave", PITCH_GROUP),
        integer(ConfigId::TRANSPOSE, (0, -11, 11), "Transpose", PITCH_GROUP),
        integer(ConfigId::SLIDE_CC, (74, 0, 127), "Slide CC", PLAY_GROUP),
        options(
            ConfigId::SLIDE_MODE,
            (0, 0, 2),
            "Slide Mode",
            &["Absolute", "Relative Unipolar", "Relative Bipolar"],
            PLAY_GROUP,
        ),
        integer(ConfigId::VELOCITY_SENSITIVITY, (100, 0, 127), "Strike Sensitivity", SENSITIVITY_GROUP),
        integer(ConfigId::GLIDE_SENSITIVITY, (100, 0, 127), "Glide Sensitivity", SENSITIVITY_GROUP),
        integer(ConfigId::SLIDE_SENSITIVITY, (100, 0, 127), "Slide Sensitivity", SENSITIVITY_GROUP),
        integer(ConfigId::PRESSURE_SENSITIVITY, (100, 0, 127), "Pressure Sensitivity", SENSITIVITY_GROUP),
        integer(ConfigId::LIFT_SENSITIVITY, (100, 0, 127), "Lift Sensitivity", SENSITIVITY_GROUP),
        boolean(ConfigId::FIXED_VELOCITY, 0, "Fixed Velocity", SENSITIVITY_GROUP),
        integer(ConfigId::FIXED_VELOCITY_VALUE, (127, 1, 127), "Fixed Velocity Value", SENSITIVITY_GROUP),
        boolean(ConfigId::PIANO_MODE, 0, "Piano Mode", PLAY_GROUP),
        integer(ConfigId::GLIDE_LOCK, (0, 0, 127), "Glide Rate", PLAY_GROUP),
        boolean(ConfigId::GLIDE_LOCK_ENABLE, 0, "Glide Lock Enable", PLAY_GROUP),
        integer(ConfigId::MODE, (4, 1, 5), "Mode", PLAY_GROUP),
        integer(ConfigId::VOLUME, (100, 0, 127), "Volume", PLAY_GROUP),
        integer(ConfigId::SCALE, (0, 0, 18), "Scale", PLAY_GROUP),
        boolean(ConfigId::HIDE_MODE, 0, "Hide Mode", PLAY_GROUP),
        integer(ConfigId::CHORD, (0, 0, 127), "Chord", PLAY_GROUP),
        integer(ConfigId::ARP_PATTERN, (0, 0, 127), "Arp Pattern", PLAY_GROUP),
        integer(ConfigId::TEMPO, (120, 1, 300), "Tempo", RHYTHM_GROUP),
        options(ConfigId::KEY, (0, 0, 11), "Key", &KEYS, PLAY_GROUP),
        boolean(ConfigId::AUTO_TRANSPOSE_TO_KEY, 0, "Auto Transpose To Key", PITCH_GROUP),
        options(ConfigId::X_TRACKING_MODE, (1, 1, 4), "Glide Tracking", &TRACKING, PLAY_GROUP),
        options(ConfigId::Y_TRACKING_MODE, (1, 1, 4), "Slide Tracking", &TRACKING, PLAY_GROUP),
        options(
            ConfigId::Z_TRACKING_MODE,
            (1, 0, 4),
            "Pressure Tracking",
            &["Poly Aftertouch", "Last Played", "Highest", "Lowest", "Disabled", "Hardest"],
            PLAY_GROUP,
        ),
        boolean(ConfigId::GAMMA_CORRECTION, 0, "Gamma Correction", COLOURS_GROUP),
        colour(ConfigId::GLOBAL_KEY_COLOUR, "Global Key Color", COLOURS_GROUP),
        colour(ConfigId::ROOT_KEY_COLOUR, "Root Key Color", COLOURS_GROUP),
        integer(ConfigId::BRIGHTNESS, (100, 0, 100), "Brightness", COLOURS_GROUP),
    ];

    // User slots carry no metadata; scripts give them meaning
    items.extend((0..32).map(|n| ConfigItem {
        min: 0,
        max: 127,
        ..ConfigItem::bare(ConfigId::user(n))
    }));

    for (mode, group) in MODE_GROUPS.iter().enumerate() {
        let id = |item| ConfigId::mode_item(mode as u8, item);
        items.extend([
            options(
                id(ModeItem::ColorType),
                (0, 0, 4),
                "Color Scheme",
                &["Pro", "User", "Piano", "Stage", "Rainbow"],
                group,
            ),
            options(id(ModeItem::MidiMode), (0, 0, 1), "MIDI Settings", &["Single Channel", "MPE"], group),
            boolean(id(ModeItem::PitchEnable), 0, "Enable Pitch Bend", group),
            boolean(id(ModeItem::PressureEnable), 0, "Enable Pressure", group),
            boolean(id(ModeItem::ShowScale), 0, "Show Scales", group),
            colour(id(ModeItem::GlobalColour), "Global Key Color", group),
            colour(id(ModeItem::RootColour), "Root Key Color", group),
        ]);
    }

    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_default_table_size() {
        let items = default_config();
        assert_eq!(items.len(), 96);

        let ids: HashSet<ConfigId> = items.iter().map(|i| i.id).collect();
        assert_eq!(ids.len(), 96);
        assert!(!ids.contains(&ConfigId::OCTAVE_TOPOLOGY));
        assert!(items.iter().all(|i| !i.active));
    }

    #[test]
    fn test_mode_items() {
        assert_eq!(ConfigId::mode_item(0, ModeItem::ColorType), ConfigId(100));
        assert_eq!(ConfigId::mode_item(3, ModeItem::RootColour), ConfigId(127));

        let items = default_config();
        let last = items.iter().find(|i| i.id == ConfigId(127)).unwrap();
        assert_eq!(last.config_type, ConfigType::Colour);
        assert_eq!(last.group.as_deref(), Some("Mode 4"));
        assert_eq!(last.min, i32::MIN);
    }

    #[test]
    fn test_user_ids() {
        assert!(ConfigId(64).is_user());
        assert!(ConfigId(95).is_user());
        assert!(!ConfigId(63).is_user());
        assert!(!ConfigId(96).is_user());
        assert_eq!(ConfigId::user(31), ConfigId::USER_LAST);

        let items = default_config();
        let user = items.iter().find(|i| i.id == ConfigId::user(5)).unwrap();
        assert_eq!((user.value, user.min, user.max), (0, 0, 127));
        assert!(user.name.is_none());
    }

    #[test]
    fn test_option_names() {
        let items = default_config();
        let key = items.iter().find(|i| i.id == ConfigId::KEY).unwrap();
        assert_eq!(key.option_name(1), Some("C#"));
        assert_eq!(key.option_name(12), None);
        assert!(items.iter().all(|i| i.options.len() <= CONFIG_MAX_OPTIONS));
    }
}
