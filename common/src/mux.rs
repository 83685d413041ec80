use serde::{Deserialize, Serialize};

/// Which video path the switch routes. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MuxState {
    #[default]
    Disabled,
    PathAInput0Only,
    PathBInput0Only,
    PathAAll,
    PathBAll,
}

impl MuxState {
    /// Hardware contract for the TS3DV642 select/enable pins.
    pub fn lines(self) -> OutputLineSet {
        match self {
            Self::Disabled => OutputLineSet::new(false, false, false),
            Self::PathAAll => OutputLineSet::new(true, true, false),
            Self::PathBAll => OutputLineSet::new(true, true, true),
            Self::PathAInput0Only => OutputLineSet::new(true, false, false),
            Self::PathBInput0Only => OutputLineSet::new(true, false, true),
        }
    }

    /// Inverse of `lines`; every tuple the driver writes maps back to one state.
    pub fn from_lines(lines: OutputLineSet) -> Option<Self> {
        [
            Self::Disabled,
            Self::PathAAll,
            Self::PathBAll,
            Self::PathAInput0Only,
            Self::PathBInput0Only,
        ]
        .into_iter()
        .find(|state| state.lines() == lines)
    }

    /// Command token that selects this state.
    pub fn token(self) -> &'static str {
        match self {
            Self::Disabled => "OFF",
            Self::PathAAll => "A",
            Self::PathBAll => "B",
            Self::PathAInput0Only => "A0",
            Self::PathBInput0Only => "B0",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Disabled => "OFF",
            Self::PathAAll => "A",
            Self::PathBAll => "B",
            Self::PathAInput0Only => "A (input 0 only)",
            Self::PathBInput0Only => "B (input 0 only)",
        }
    }

    pub fn is_enabled(self) -> bool {
        self != Self::Disabled
    }
}

/// Hardware revision in use; decides which states exist and which tokens are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MuxVariant {
    /// `Disabled | A | B`.
    #[default]
    Basic,
    /// Adds the input-0-only routes.
    Extended,
}

impl MuxVariant {
    pub fn states(self) -> &'static [MuxState] {
        match self {
            Self::Basic => &[MuxState::PathAAll, MuxState::PathBAll, MuxState::Disabled],
            Self::Extended => &[
                MuxState::PathAAll,
                MuxState::PathBAll,
                MuxState::PathAInput0Only,
                MuxState::PathBInput0Only,
                MuxState::Disabled,
            ],
        }
    }

    pub fn supports(self, state: MuxState) -> bool {
        self.states().contains(&state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OutputLineSet {
    pub enable: bool,
    pub select1: bool,
    pub select2: bool,
}

impl OutputLineSet {
    pub const fn new(enable: bool, select1: bool, select2: bool) -> Self {
        Self {
            enable,
            select1,
            select2,
        }
    }

    pub fn as_tuple(self) -> (u8, u8, u8) {
        (
            u8::from(self.enable),
            u8::from(self.select1),
            u8::from(self.select2),
        )
    }

    fn same_route(self, other: Self) -> bool {
        self.select1 == other.select1 && self.select2 == other.select2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    Enable,
    Select1,
    Select2,
}

impl Line {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enable => "EN",
            Self::Select1 => "SEL1",
            Self::Select2 => "SEL2",
        }
    }
}

/// Digital outputs wired to the switch.
pub trait OutputLines {
    type Error;

    fn set_level(&mut self, line: Line, high: bool) -> Result<(), Self::Error>;
}

/// Drives the output lines, keeping enable/select ordering glitch free.
pub struct MuxDriver<L> {
    lines: L,
    last: Option<OutputLineSet>,
}

impl<L: OutputLines> MuxDriver<L> {
    pub fn new(lines: L) -> Self {
        Self { lines, last: None }
    }

    /// Drives every line low, enable first.
    pub fn init(&mut self) -> Result<(), L::Error> {
        self.apply(MuxState::Disabled).map(|_| ())
    }

    pub fn apply(&mut self, state: MuxState) -> Result<OutputLineSet, L::Error> {
        let target = state.lines();

        if !target.enable {
            self.lines.set_level(Line::Enable, false)?;
            self.lines.set_level(Line::Select1, target.select1)?;
            self.lines.set_level(Line::Select2, target.select2)?;
        } else {
            // Switching between two live routes: drop enable before touching the selects.
            if let Some(previous) = self.last {
                if previous.enable && !previous.same_route(target) {
                    self.lines.set_level(Line::Enable, false)?;
                }
            }
            self.lines.set_level(Line::Select1, target.select1)?;
            self.lines.set_level(Line::Select2, target.select2)?;
            self.lines.set_level(Line::Enable, true)?;
        }

        self.last = Some(target);
        Ok(target)
    }

    /// Tuple written by the most recent successful `apply`.
    pub fn last_applied(&self) -> Option<OutputLineSet> {
        self.last
    }

    pub fn lines(&self) -> &L {
        &self.lines
    }
}
