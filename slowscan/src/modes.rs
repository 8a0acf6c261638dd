//! Transmission mode descriptions.
//!
//! Every supported mode is a [`ModeSpec`] constant describing its header
//! code, geometry and scanline timing grammar. The decoder never hardcodes
//! a mode; everything it needs comes from the spec identified by the
//! header.

use std::{
    collections::HashMap,
    sync::OnceLock,
};

/// Allowed drift between a mode's declared line time and the sum of its
/// parts, in seconds.
pub const LINE_TIME_TOLERANCE: f32 = 0.0001;

/// What a scanline channel carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    Red,
    Green,
    Blue,
    /// Luminance of the scanline.
    Luma,
    /// Luminance of the second image row covered by the same scanline.
    LumaOdd,
    /// R-Y chrominance.
    ChromaR,
    /// B-Y chrominance.
    ChromaB,
    /// Chrominance that alternates by line parity: R-Y on even lines, B-Y
    /// on odd lines.
    ChromaAlt,
}

#[derive(Clone, Copy, Debug)]
pub struct Channel {
    pub kind: ChannelKind,
    /// Transmission time of the channel in seconds.
    pub time: f32,
}

impl Channel {
    const fn new(kind: ChannelKind, time: f32) -> Self {
        Self { kind, time }
    }
}

/// How decoded channels combine into pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorFormat {
    /// One channel per primary, in the order given by the channel list.
    Rgb,
    /// Luminance plus a full-rate chrominance pair.
    YCrCb,
    /// Luminance plus a single chrominance channel shared by neighboring
    /// lines ([`ChannelKind::ChromaAlt`]).
    YCrCbHalf,
    /// Two luminance channels sharing one chrominance pair, so each
    /// scanline carries two image rows.
    YCrCbDual,
}

/// Where the sync pulse sits within a scanline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPosition {
    /// Sync then porch open the line.
    LineStart,
    /// Sync then porch precede the final channel, with separators opening
    /// the earlier channels.
    BeforeFinal,
}

/// Timing grammar and geometry of one transmission mode.
#[derive(Clone, Copy, Debug)]
pub struct ModeSpec {
    pub name: &'static str,
    pub short_name: &'static str,
    /// Code carried by the calibration header.
    pub vis_code: u8,
    pub width: usize,
    pub height: usize,
    /// Nominal time of one scanline in seconds, sync included.
    pub line_time: f32,
    pub sync_pulse_time: f32,
    pub porch_time: f32,
    /// Time of one separator slot, zero if the mode has none.
    pub separator_time: f32,
    pub separator_slots: usize,
    pub channels: &'static [Channel],
    pub color: ColorFormat,
    pub sync_position: SyncPosition,
}

impl ModeSpec {
    pub const MARTIN_M1: Self = Self {
        name: "Martin M1",
        short_name: "m1",
        vis_code: 44,
        width: 320,
        height: 256,
        line_time: 446.446e-3,
        sync_pulse_time: 4.862e-3,
        porch_time: 0.572e-3,
        separator_time: 0.572e-3,
        separator_slots: 3,
        channels: &[
            Channel::new(ChannelKind::Green, 146.432e-3),
            Channel::new(ChannelKind::Blue, 146.432e-3),
            Channel::new(ChannelKind::Red, 146.432e-3),
        ],
        color: ColorFormat::Rgb,
        sync_position: SyncPosition::LineStart,
    };

    pub const MARTIN_M2: Self = Self {
        name: "Martin M2",
        short_name: "m2",
        vis_code: 40,
        width: 320,
        height: 256,
        line_time: 226.798e-3,
        sync_pulse_time: 4.862e-3,
        porch_time: 0.572e-3,
        separator_time: 0.572e-3,
        separator_slots: 3,
        channels: &[
            Channel::new(ChannelKind::Green, 73.216e-3),
            Channel::new(ChannelKind::Blue, 73.216e-3),
            Channel::new(ChannelKind::Red, 73.216e-3),
        ],
        color: ColorFormat::Rgb,
        sync_position: SyncPosition::LineStart,
    };

    pub const SCOTTIE_S1: Self = Self {
        name: "Scottie S1",
        short_name: "s1",
        vis_code: 60,
        width: 320,
        height: 256,
        line_time: 428.22e-3,
        sync_pulse_time: 9.0e-3,
        porch_time: 1.5e-3,
        separator_time: 1.5e-3,
        separator_slots: 2,
        channels: &[
            Channel::new(ChannelKind::Green, 138.24e-3),
            Channel::new(ChannelKind::Blue, 138.24e-3),
            Channel::new(ChannelKind::Red, 138.24e-3),
        ],
        color: ColorFormat::Rgb,
        sync_position: SyncPosition::BeforeFinal,
    };

    pub const SCOTTIE_S2: Self = Self {
        name: "Scottie S2",
        short_name: "s2",
        vis_code: 56,
        width: 320,
        height: 256,
        line_time: 277.692e-3,
        sync_pulse_time: 9.0e-3,
        porch_time: 1.5e-3,
        separator_time: 1.5e-3,
        separator_slots: 2,
        channels: &[
            Channel::new(ChannelKind::Green, 88.064e-3),
            Channel::new(ChannelKind::Blue, 88.064e-3),
            Channel::new(ChannelKind::Red, 88.064e-3),
        ],
        color: ColorFormat::Rgb,
        sync_position: SyncPosition::BeforeFinal,
    };

    pub const SCOTTIE_DX: Self = Self {
        name: "Scottie DX",
        short_name: "sdx",
        vis_code: 76,
        width: 320,
        height: 256,
        line_time: 1050.3e-3,
        sync_pulse_time: 9.0e-3,
        porch_time: 1.5e-3,
        separator_time: 1.5e-3,
        separator_slots: 2,
        channels: &[
            Channel::new(ChannelKind::Green, 345.6e-3),
            Channel::new(ChannelKind::Blue, 345.6e-3),
            Channel::new(ChannelKind::Red, 345.6e-3),
        ],
        color: ColorFormat::Rgb,
        sync_position: SyncPosition::BeforeFinal,
    };

    pub const ROBOT_36: Self = Self {
        name: "Robot 36",
        short_name: "r36",
        vis_code: 8,
        width: 320,
        height: 240,
        line_time: 150.0e-3,
        sync_pulse_time: 9.0e-3,
        porch_time: 3.0e-3,
        separator_time: 6.0e-3,
        separator_slots: 1,
        channels: &[
            Channel::new(ChannelKind::Luma, 88.0e-3),
            Channel::new(ChannelKind::ChromaAlt, 44.0e-3),
        ],
        color: ColorFormat::YCrCbHalf,
        sync_position: SyncPosition::LineStart,
    };

    pub const ROBOT_72: Self = Self {
        name: "Robot 72",
        short_name: "r72",
        vis_code: 12,
        width: 320,
        height: 240,
        line_time: 300.0e-3,
        sync_pulse_time: 9.0e-3,
        porch_time: 3.0e-3,
        separator_time: 6.0e-3,
        separator_slots: 2,
        channels: &[
            Channel::new(ChannelKind::Luma, 138.0e-3),
            Channel::new(ChannelKind::ChromaR, 69.0e-3),
            Channel::new(ChannelKind::ChromaB, 69.0e-3),
        ],
        color: ColorFormat::YCrCb,
        sync_position: SyncPosition::LineStart,
    };

    pub const PD_90: Self = Self {
        name: "PD-90",
        short_name: "pd90",
        vis_code: 99,
        width: 320,
        height: 256,
        line_time: 703.04e-3,
        sync_pulse_time: 20.0e-3,
        porch_time: 2.08e-3,
        separator_time: 0.0,
        separator_slots: 0,
        channels: &[
            Channel::new(ChannelKind::Luma, 170.24e-3),
            Channel::new(ChannelKind::ChromaR, 170.24e-3),
            Channel::new(ChannelKind::ChromaB, 170.24e-3),
            Channel::new(ChannelKind::LumaOdd, 170.24e-3),
        ],
        color: ColorFormat::YCrCbDual,
        sync_position: SyncPosition::LineStart,
    };

    pub const PD_120: Self = Self {
        name: "PD-120",
        short_name: "pd120",
        vis_code: 95,
        width: 640,
        height: 496,
        line_time: 508.48e-3,
        sync_pulse_time: 20.0e-3,
        porch_time: 2.08e-3,
        separator_time: 0.0,
        separator_slots: 0,
        channels: &[
            Channel::new(ChannelKind::Luma, 121.6e-3),
            Channel::new(ChannelKind::ChromaR, 121.6e-3),
            Channel::new(ChannelKind::ChromaB, 121.6e-3),
            Channel::new(ChannelKind::LumaOdd, 121.6e-3),
        ],
        color: ColorFormat::YCrCbDual,
        sync_position: SyncPosition::LineStart,
    };

    pub const PD_160: Self = Self {
        name: "PD-160",
        short_name: "pd160",
        vis_code: 98,
        width: 512,
        height: 400,
        line_time: 804.416e-3,
        sync_pulse_time: 20.0e-3,
        porch_time: 2.08e-3,
        separator_time: 0.0,
        separator_slots: 0,
        channels: &[
            Channel::new(ChannelKind::Luma, 195.584e-3),
            Channel::new(ChannelKind::ChromaR, 195.584e-3),
            Channel::new(ChannelKind::ChromaB, 195.584e-3),
            Channel::new(ChannelKind::LumaOdd, 195.584e-3),
        ],
        color: ColorFormat::YCrCbDual,
        sync_position: SyncPosition::LineStart,
    };

    pub const PD_180: Self = Self {
        name: "PD-180",
        short_name: "pd180",
        vis_code: 96,
        width: 640,
        height: 496,
        line_time: 754.24e-3,
        sync_pulse_time: 20.0e-3,
        porch_time: 2.08e-3,
        separator_time: 0.0,
        separator_slots: 0,
        channels: &[
            Channel::new(ChannelKind::Luma, 183.04e-3),
            Channel::new(ChannelKind::ChromaR, 183.04e-3),
            Channel::new(ChannelKind::ChromaB, 183.04e-3),
            Channel::new(ChannelKind::LumaOdd, 183.04e-3),
        ],
        color: ColorFormat::YCrCbDual,
        sync_position: SyncPosition::LineStart,
    };

    pub const PD_240: Self = Self {
        name: "PD-240",
        short_name: "pd240",
        vis_code: 97,
        width: 640,
        height: 496,
        line_time: 1000.0e-3,
        sync_pulse_time: 20.0e-3,
        porch_time: 2.08e-3,
        separator_time: 0.0,
        separator_slots: 0,
        channels: &[
            Channel::new(ChannelKind::Luma, 244.48e-3),
            Channel::new(ChannelKind::ChromaR, 244.48e-3),
            Channel::new(ChannelKind::ChromaB, 244.48e-3),
            Channel::new(ChannelKind::LumaOdd, 244.48e-3),
        ],
        color: ColorFormat::YCrCbDual,
        sync_position: SyncPosition::LineStart,
    };

    /// Sum of all channel transmission times.
    pub fn channel_time(&self) -> f32 {
        self.channels.iter().map(|channel| channel.time).sum()
    }

    /// Line time reconstructed from the mode's parts.
    pub fn expected_line_time(&self) -> f32 {
        self.sync_pulse_time
            + self.porch_time
            + self.separator_slots as f32 * self.separator_time
            + self.channel_time()
    }

    /// Number of scanlines in the audio stream. For
    /// [`ColorFormat::YCrCbDual`] every scanline carries two image rows.
    pub fn audio_lines(&self) -> usize {
        match self.color {
            ColorFormat::YCrCbDual => self.height / 2,
            _ => self.height,
        }
    }

    /// Position of a channel kind within the channel list.
    pub fn channel_position(&self, kind: ChannelKind) -> Option<usize> {
        self.channels.iter().position(|channel| channel.kind == kind)
    }

    /// Whether the spec is internally consistent: sane geometry and a line
    /// time that matches the sum of its parts.
    pub fn is_well_formed(&self) -> bool {
        let shape = match self.color {
            ColorFormat::Rgb => {
                self.channel_position(ChannelKind::Red).is_some()
                    && self.channel_position(ChannelKind::Green).is_some()
                    && self.channel_position(ChannelKind::Blue).is_some()
            }
            ColorFormat::YCrCb => {
                self.channel_position(ChannelKind::Luma).is_some()
                    && self.channel_position(ChannelKind::ChromaR).is_some()
                    && self.channel_position(ChannelKind::ChromaB).is_some()
            }
            ColorFormat::YCrCbHalf => {
                self.channel_position(ChannelKind::Luma).is_some()
                    && self.channel_position(ChannelKind::ChromaAlt).is_some()
            }
            ColorFormat::YCrCbDual => {
                self.height % 2 == 0
                    && self.channel_position(ChannelKind::Luma).is_some()
                    && self.channel_position(ChannelKind::LumaOdd).is_some()
                    && self.channel_position(ChannelKind::ChromaR).is_some()
                    && self.channel_position(ChannelKind::ChromaB).is_some()
            }
        };

        shape
            && self.width > 0
            && self.height > 0
            && !self.channels.is_empty()
            && (self.expected_line_time() - self.line_time).abs() <= LINE_TIME_TOLERANCE
    }
}

/// All built-in modes.
pub fn all() -> &'static [&'static ModeSpec] {
    const ALL: &[&ModeSpec] = &[
        &ModeSpec::MARTIN_M1,
        &ModeSpec::MARTIN_M2,
        &ModeSpec::SCOTTIE_S1,
        &ModeSpec::SCOTTIE_S2,
        &ModeSpec::SCOTTIE_DX,
        &ModeSpec::ROBOT_36,
        &ModeSpec::ROBOT_72,
        &ModeSpec::PD_90,
        &ModeSpec::PD_120,
        &ModeSpec::PD_160,
        &ModeSpec::PD_180,
        &ModeSpec::PD_240,
    ];
    ALL
}

/// Looks up the mode a header code identifies.
pub fn by_vis_code(vis_code: u8) -> Option<&'static ModeSpec> {
    static MODES: OnceLock<HashMap<u8, &'static ModeSpec>> = OnceLock::new();
    let modes = MODES.get_or_init(|| {
        all()
            .iter()
            .map(|mode| (mode.vis_code, *mode))
            .collect()
    });
    modes.get(&vis_code).copied().and_then(checked)
}

/// Looks up a mode by name or short name, case insensitive.
pub fn by_name(name: &str) -> Option<&'static ModeSpec> {
    all()
        .iter()
        .copied()
        .find(|mode| {
            mode.name.eq_ignore_ascii_case(name) || mode.short_name.eq_ignore_ascii_case(name)
        })
        .and_then(checked)
}

fn checked(mode: &'static ModeSpec) -> Option<&'static ModeSpec> {
    if mode.is_well_formed() {
        Some(mode)
    }
    else {
        tracing::warn!(mode = mode.name, "rejecting malformed mode spec");
        None
    }
}
