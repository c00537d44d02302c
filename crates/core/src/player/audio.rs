/// Volume, mute and balance state of a session.
///
/// `volume` always holds the value the listener asked for. While muted the
/// backend runs at zero and `volume` doubles as the cached pre-mute value,
/// so volume writes issued during mute take effect on un-mute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioControls {
    volume: f32,
    muted: bool,
    balance: f32,
}

impl AudioControls {
    /// Controls starting at the volume the backend reports after init.
    pub fn with_volume(volume: f32) -> Self {
        let mut controls = Self::default();
        controls.set_volume(volume);
        controls
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn balance(&self) -> f32 {
        self.balance
    }

    /// Volume the backend should currently be playing at.
    pub fn effective_volume(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            self.volume
        }
    }

    /// Records a volume in `[0, 1]`. Returns the value to push to the
    /// backend, or `None` while muted.
    pub fn set_volume(&mut self, volume: f32) -> Option<f32> {
        self.volume = clamp_or(volume, 0.0, 1.0, self.volume);
        (!self.muted).then_some(self.volume)
    }

    /// Toggles mute. Returns the backend volume to apply, or `None` when the
    /// mute state did not change.
    pub fn set_mute(&mut self, mute: bool) -> Option<f32> {
        if self.muted == mute {
            return None;
        }
        self.muted = mute;
        Some(self.effective_volume())
    }

    /// Records a balance in `[-1, 1]` and returns it.
    pub fn set_balance(&mut self, balance: f32) -> f32 {
        self.balance = clamp_or(balance, -1.0, 1.0, self.balance);
        self.balance
    }
}

impl Default for AudioControls {
    fn default() -> Self {
        Self {
            volume: 1.0,
            muted: false,
            balance: 0.0,
        }
    }
}

fn clamp_or(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    if value.is_nan() {
        fallback
    } else {
        value.clamp(min, max)
    }
}
