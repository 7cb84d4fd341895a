//! Per-button gesture classification.
//!
//! Each physical button owns one [`GestureClassifier`]. The edge interrupt only
//! latches sticky rising/falling flags in an [`EdgeLatch`]; the classifier task
//! takes those flags on every poll together with the sampled pin level and
//! advances a small debounce/click/long-press state machine. The orchestrator
//! reads the classified [`Action`] through the [`GesturePort`] trait and never
//! touches the flags.

use core::{fmt, time::Duration};

use portable_atomic::{AtomicBool, Ordering};

use crate::time::Timestamp;

/// Number of physical buttons on every supported hardware revision.
pub const NUM_BUTTONS: usize = 6;

/// Default debounce window applied to every edge.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);
/// Default window in which a further press extends a multi-click.
pub const DEFAULT_INTER_CLICK: Duration = Duration::from_millis(500);
/// Default hold durations for the four long-press tiers.
pub const DEFAULT_LONG_TIERS: [Duration; 4] = [
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(20),
];

/// One-based identifier of a physical button.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ButtonId(u8);

impl ButtonId {
    /// Builds an identifier, rejecting zero and ids beyond [`NUM_BUTTONS`].
    #[must_use]
    pub const fn new(raw: u8) -> Option<Self> {
        if raw == 0 || raw as usize > NUM_BUTTONS {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Builds an identifier from a zero-based slot index.
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        if index >= NUM_BUTTONS {
            None
        } else {
            Some(Self(index as u8 + 1))
        }
    }

    /// Returns the one-based identifier.
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Returns the zero-based slot index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize - 1
    }

    /// Iterates every button id in ascending order.
    pub fn all() -> impl Iterator<Item = ButtonId> {
        (0..NUM_BUTTONS).filter_map(ButtonId::from_index)
    }
}

impl fmt::Display for ButtonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Long-press tiers, ordered by hold duration.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum LongTier {
    One,
    Two,
    Three,
    Four,
}

impl LongTier {
    /// All tiers in ascending order.
    pub const ALL: [LongTier; 4] = [LongTier::One, LongTier::Two, LongTier::Three, LongTier::Four];

    /// Returns the tier number (1..=4).
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            LongTier::One => 1,
            LongTier::Two => 2,
            LongTier::Three => 3,
            LongTier::Four => 4,
        }
    }
}

/// Classified outcome of a button interaction.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Action {
    Idle,
    Single,
    Double,
    Triple,
    Quad,
    Long(LongTier),
}

impl Action {
    /// Returns the click count for click actions, zero otherwise.
    #[must_use]
    pub const fn click_count(self) -> u8 {
        match self {
            Action::Single => 1,
            Action::Double => 2,
            Action::Triple => 3,
            Action::Quad => 4,
            Action::Idle | Action::Long(_) => 0,
        }
    }

    /// Returns `true` for single through quadruple clicks.
    #[must_use]
    pub const fn is_click(self) -> bool {
        self.click_count() > 0
    }

    /// Returns `true` for any long-press tier.
    #[must_use]
    pub const fn is_long(self) -> bool {
        matches!(self, Action::Long(_))
    }

    /// Short label used by logs and transcripts.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Action::Idle => "idle",
            Action::Single => "single",
            Action::Double => "double",
            Action::Triple => "triple",
            Action::Quad => "quad",
            Action::Long(LongTier::One) => "long-1",
            Action::Long(LongTier::Two) => "long-2",
            Action::Long(LongTier::Three) => "long-3",
            Action::Long(LongTier::Four) => "long-4",
        }
    }

    const fn promote(self) -> Self {
        match self {
            Action::Single => Action::Double,
            Action::Double => Action::Triple,
            Action::Triple | Action::Quad => Action::Quad,
            other => other,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reasons a [`GestureTimings`] value is rejected.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GestureConfigError {
    ZeroDebounce,
    DebounceNotShorterThanInterClick,
    LongTiersNotAscending,
    FirstTierWithinInterClick,
}

impl fmt::Display for GestureConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Validated timing configuration for a classifier.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GestureTimings {
    debounce: Duration,
    inter_click: Duration,
    long: [Duration; 4],
}

impl GestureTimings {
    /// Validates and builds a timing configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`GestureConfigError`] when the windows overlap or the long
    /// thresholds are not strictly ascending.
    pub fn new(
        debounce: Duration,
        inter_click: Duration,
        long: [Duration; 4],
    ) -> Result<Self, GestureConfigError> {
        if debounce.is_zero() {
            return Err(GestureConfigError::ZeroDebounce);
        }
        if debounce >= inter_click {
            return Err(GestureConfigError::DebounceNotShorterThanInterClick);
        }
        if long.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(GestureConfigError::LongTiersNotAscending);
        }
        if long[0] <= inter_click {
            return Err(GestureConfigError::FirstTierWithinInterClick);
        }
        Ok(Self {
            debounce,
            inter_click,
            long,
        })
    }

    #[must_use]
    pub const fn debounce(&self) -> Duration {
        self.debounce
    }

    #[must_use]
    pub const fn inter_click(&self) -> Duration {
        self.inter_click
    }

    /// Returns the hold threshold for `tier`.
    #[must_use]
    pub const fn long_threshold(&self, tier: LongTier) -> Duration {
        self.long[tier.number() as usize - 1]
    }

    /// Returns the highest tier reached after holding for `held`.
    #[must_use]
    pub fn tier_for(&self, held: Duration) -> Option<LongTier> {
        LongTier::ALL
            .iter()
            .rev()
            .copied()
            .find(|tier| held >= self.long_threshold(*tier))
    }
}

impl Default for GestureTimings {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            inter_click: DEFAULT_INTER_CLICK,
            long: DEFAULT_LONG_TIERS,
        }
    }
}

/// Edge flags taken from an [`EdgeLatch`] for one poll.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Edges {
    pub rising: bool,
    pub falling: bool,
}

/// Sticky edge flags shared between the edge interrupt and the classifier task.
#[derive(Debug)]
pub struct EdgeLatch {
    rising: AtomicBool,
    falling: AtomicBool,
}

impl EdgeLatch {
    pub const fn new() -> Self {
        Self {
            rising: AtomicBool::new(false),
            falling: AtomicBool::new(false),
        }
    }

    /// Called from the interrupt with the pin level observed after the edge.
    pub fn record_edge(&self, pressed: bool) {
        if pressed {
            self.rising.store(true, Ordering::Release);
        } else {
            self.falling.store(true, Ordering::Release);
        }
    }

    /// Consumes and clears both flags.
    pub fn take(&self) -> Edges {
        Edges {
            rising: self.rising.swap(false, Ordering::AcqRel),
            falling: self.falling.swap(false, Ordering::AcqRel),
        }
    }
}

impl Default for EdgeLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Debounce/click state of a classifier.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ClassifierPhase {
    Idle,
    Debounce,
    Pressed,
    ReleaseDebounce,
    AwaitMoreClicks,
    RepeatDebounce,
    RepeatPressed,
    RepeatReleaseDebounce,
    LongReleaseDebounce,
    Finished,
}

/// Read-only view of a classifier handed to the orchestrator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GestureSnapshot {
    pub action: Action,
    pub finished: bool,
}

impl GestureSnapshot {
    pub const IDLE: Self = Self {
        action: Action::Idle,
        finished: false,
    };
}

/// Gesture state machine for a single button.
#[derive(Copy, Clone, Debug)]
pub struct GestureClassifier<I> {
    timings: GestureTimings,
    phase: ClassifierPhase,
    phase_since: Option<I>,
    press_start: Option<I>,
    released_at: Option<I>,
    click_count: u8,
    action: Action,
    finished: bool,
    raw_pressed: bool,
    enabled: bool,
}

impl<I: Timestamp> GestureClassifier<I> {
    pub const fn new(timings: GestureTimings) -> Self {
        Self {
            timings,
            phase: ClassifierPhase::Idle,
            phase_since: None,
            press_start: None,
            released_at: None,
            click_count: 0,
            action: Action::Idle,
            finished: false,
            raw_pressed: false,
            enabled: false,
        }
    }

    pub const fn phase(&self) -> ClassifierPhase {
        self.phase
    }

    pub const fn action(&self) -> Action {
        self.action
    }

    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    pub const fn click_count(&self) -> u8 {
        self.click_count
    }

    pub const fn raw_pressed(&self) -> bool {
        self.raw_pressed
    }

    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub const fn snapshot(&self) -> GestureSnapshot {
        GestureSnapshot {
            action: self.action,
            finished: self.finished,
        }
    }

    /// Starts reacting to edges.
    pub fn begin(&mut self) {
        self.enabled = true;
    }

    /// Stops reacting to edges; the current classification is kept.
    pub fn end(&mut self) {
        self.enabled = false;
    }

    /// Returns the classifier to Idle and forgets the current gesture.
    pub fn clear(&mut self) {
        self.phase = ClassifierPhase::Idle;
        self.phase_since = None;
        self.press_start = None;
        self.released_at = None;
        self.click_count = 0;
        self.action = Action::Idle;
        self.finished = false;
    }

    /// Seeds the machine as if a press had started at `now`.
    ///
    /// Used for the button that woke the device: its edge fired before the
    /// classifier existed.
    pub fn init_press(&mut self, now: I) {
        self.phase = ClassifierPhase::Pressed;
        self.phase_since = Some(now);
        self.press_start = Some(now);
        self.released_at = None;
        self.click_count = 1;
        self.action = Action::Single;
        self.finished = false;
        self.raw_pressed = true;
    }

    /// Advances the machine with the edges latched since the last poll and the
    /// current pin level.
    pub fn update(&mut self, now: I, edges: Edges, pressed: bool) {
        self.raw_pressed = pressed;
        if !self.enabled {
            return;
        }

        let released = edges.falling || !pressed;
        match self.phase {
            ClassifierPhase::Idle => {
                if edges.rising {
                    self.enter(ClassifierPhase::Debounce, now);
                    self.press_start = Some(now);
                }
            }
            ClassifierPhase::Debounce => {
                if self.window_elapsed(now) {
                    if pressed {
                        self.click_count = 1;
                        self.action = Action::Single;
                        self.enter(ClassifierPhase::Pressed, now);
                    } else {
                        self.clear();
                    }
                }
            }
            ClassifierPhase::Pressed => {
                self.upgrade_long_tier(now);
                if released {
                    let next = if self.action.is_long() {
                        ClassifierPhase::LongReleaseDebounce
                    } else {
                        ClassifierPhase::ReleaseDebounce
                    };
                    self.enter(next, now);
                }
            }
            ClassifierPhase::ReleaseDebounce | ClassifierPhase::RepeatReleaseDebounce => {
                if self.window_elapsed(now) {
                    if pressed {
                        let back = if self.phase == ClassifierPhase::ReleaseDebounce {
                            ClassifierPhase::Pressed
                        } else {
                            ClassifierPhase::RepeatPressed
                        };
                        self.phase = back;
                    } else {
                        self.released_at = self.phase_since;
                        self.enter(ClassifierPhase::AwaitMoreClicks, now);
                    }
                }
            }
            ClassifierPhase::AwaitMoreClicks => {
                if edges.rising {
                    self.enter(ClassifierPhase::RepeatDebounce, now);
                } else if self.inter_click_expired(now) {
                    self.finish(now);
                }
            }
            ClassifierPhase::RepeatDebounce => {
                if self.window_elapsed(now) {
                    if pressed {
                        self.click_count = (self.click_count + 1).min(4);
                        self.action = self.action.promote();
                        self.press_start = self.phase_since;
                        self.enter(ClassifierPhase::RepeatPressed, now);
                    } else {
                        // bounce; the inter-click window keeps running
                        self.phase = ClassifierPhase::AwaitMoreClicks;
                    }
                }
            }
            ClassifierPhase::RepeatPressed => {
                if released {
                    self.enter(ClassifierPhase::RepeatReleaseDebounce, now);
                }
            }
            ClassifierPhase::LongReleaseDebounce => {
                if self.window_elapsed(now) {
                    if pressed {
                        self.phase = ClassifierPhase::Pressed;
                        self.upgrade_long_tier(now);
                    } else {
                        self.finish(now);
                    }
                }
            }
            ClassifierPhase::Finished => {}
        }
    }

    fn enter(&mut self, phase: ClassifierPhase, now: I) {
        self.phase = phase;
        self.phase_since = Some(now);
    }

    fn finish(&mut self, now: I) {
        self.finished = true;
        self.enter(ClassifierPhase::Finished, now);
    }

    fn window_elapsed(&self, now: I) -> bool {
        self.phase_since
            .is_none_or(|since| now.has_elapsed(since, self.timings.debounce))
    }

    fn inter_click_expired(&self, now: I) -> bool {
        self.released_at
            .or(self.phase_since)
            .is_none_or(|since| now.has_elapsed(since, self.timings.inter_click))
    }

    fn upgrade_long_tier(&mut self, now: I) {
        let Some(start) = self.press_start else {
            return;
        };
        let held = now.saturating_duration_since(start);
        if let Some(tier) = self.timings.tier_for(held) {
            let current = match self.action {
                Action::Long(existing) => Some(existing),
                _ => None,
            };
            if current.is_none_or(|existing| tier > existing) {
                self.action = Action::Long(tier);
            }
        }
    }
}

/// Gesture access used by the orchestrator.
pub trait GesturePort {
    type Instant: Timestamp;

    /// Returns the classification of `id`.
    fn snapshot(&self, id: ButtonId) -> GestureSnapshot;

    /// Returns the first button whose classification is not Idle.
    fn active(&self) -> Option<ButtonId> {
        ButtonId::all().find(|id| self.snapshot(*id).action != Action::Idle)
    }

    /// Clears every classifier back to Idle.
    fn clear_all(&mut self);

    /// Seeds a press on `id`, see [`GestureClassifier::init_press`].
    fn init_press(&mut self, id: ButtonId, now: Self::Instant);

    /// Enables edge processing on all buttons.
    fn start(&mut self);

    /// Disables edge processing on all buttons.
    fn stop(&mut self);
}

/// Fixed set of classifiers, one per button.
#[derive(Clone, Debug)]
pub struct GestureBank<I, const N: usize = NUM_BUTTONS> {
    classifiers: [GestureClassifier<I>; N],
}

impl<I: Timestamp, const N: usize> GestureBank<I, N> {
    pub const fn new(timings: GestureTimings) -> Self {
        Self {
            classifiers: [GestureClassifier::new(timings); N],
        }
    }

    /// Polls one classifier.
    pub fn update(&mut self, id: ButtonId, now: I, edges: Edges, pressed: bool) {
        if let Some(classifier) = self.classifiers.get_mut(id.index()) {
            classifier.update(now, edges, pressed);
        }
    }

    pub fn classifier(&self, id: ButtonId) -> Option<&GestureClassifier<I>> {
        self.classifiers.get(id.index())
    }

    pub fn ids(&self) -> impl Iterator<Item = ButtonId> {
        (0..N).filter_map(ButtonId::from_index)
    }
}

impl<I: Timestamp, const N: usize> GesturePort for GestureBank<I, N> {
    type Instant = I;

    fn snapshot(&self, id: ButtonId) -> GestureSnapshot {
        self.classifiers
            .get(id.index())
            .map_or(GestureSnapshot::IDLE, GestureClassifier::snapshot)
    }

    fn clear_all(&mut self) {
        self.classifiers.iter_mut().for_each(GestureClassifier::clear);
    }

    fn init_press(&mut self, id: ButtonId, now: I) {
        if let Some(classifier) = self.classifiers.get_mut(id.index()) {
            classifier.init_press(now);
        }
    }

    fn start(&mut self) {
        self.classifiers.iter_mut().for_each(GestureClassifier::begin);
    }

    fn stop(&mut self) {
        self.classifiers.iter_mut().for_each(GestureClassifier::end);
    }
}
