//! Concrete filter stages.
//!
//! Pixel work happens on the device behind the surface handles; the stages
//! here own the surfaces, carry frame metadata through and do the timing
//! changes their operation implies.

use serde::{Deserialize, Serialize};

use hwtc_core::error::{EngineError, Result};
use hwtc_core::types::{Frame, FrameFlags, PictureStructure, Surface};

use crate::filter_chain::{FilterStage, FrameLayout, SelectEvery, StageKind, StageOutputs};

/// Input frame metadata carried onto `surface` with the stage's output
/// layout.
fn derive(input: &Frame, surface: Surface, layout: &FrameLayout) -> Frame {
    Frame {
        surface,
        width: layout.width,
        height: layout.height,
        format: layout.format,
        picstruct: layout.picstruct,
        ..input.clone()
    }
}

/// Round-robin set of stage-owned surfaces.
#[derive(Debug)]
struct SurfaceRing {
    surfaces: Vec<Surface>,
    next: usize,
}

impl SurfaceRing {
    fn new(surfaces: Vec<Surface>) -> Self {
        Self { surfaces, next: 0 }
    }

    fn next(&mut self) -> Result<Surface> {
        let surface = *self
            .surfaces
            .get(self.next)
            .ok_or_else(|| EngineError::InvariantViolation("stage has no surfaces".into()))?;
        self.next = (self.next + 1) % self.surfaces.len();
        Ok(surface)
    }
}

// ─── Converting stages ───────────────────────────────────────────────────

/// One output per input written to a new surface: format normalization,
/// color conversion, crop, denoise, resize, sharpen, deband, pad and the
/// encoder-format pre-pass.
#[derive(Debug)]
pub struct ConvertStage {
    kind: StageKind,
    name: String,
    out: FrameLayout,
    ring: SurfaceRing,
}

impl ConvertStage {
    pub fn new(kind: StageKind, name: &str, out: FrameLayout, surfaces: Vec<Surface>) -> Self {
        Self {
            kind,
            name: name.to_string(),
            out,
            ring: SurfaceRing::new(surfaces),
        }
    }
}

impl FilterStage for ConvertStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn filter(&mut self, input: Option<&Frame>, out: &mut StageOutputs) -> Result<()> {
        let Some(frame) = input else { return Ok(()) };
        let surface = self.ring.next()?;
        out.push(derive(frame, surface, &self.out))
    }
}

/// Rewrites its input surface in place (logo removal, tweak, subtitle
/// burn-in). The same buffer passes through.
#[derive(Debug)]
pub struct OverwriteStage {
    kind: StageKind,
    name: String,
}

impl OverwriteStage {
    pub fn new(kind: StageKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
        }
    }
}

impl FilterStage for OverwriteStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn filter(&mut self, input: Option<&Frame>, out: &mut StageOutputs) -> Result<()> {
        match input {
            Some(frame) => out.push(frame.clone()),
            None => Ok(()),
        }
    }
}

// ─── Field handling ──────────────────────────────────────────────────────

/// Applies repeat-field flags by field copying. After an odd number of
/// repeated fields the output field order is swapped.
#[derive(Debug)]
pub struct RepeatFieldStage {
    out: FrameLayout,
    ring: SurfaceRing,
    swapped: bool,
}

impl RepeatFieldStage {
    pub fn new(out: FrameLayout, surfaces: Vec<Surface>) -> Self {
        Self {
            out,
            ring: SurfaceRing::new(surfaces),
            swapped: false,
        }
    }
}

impl FilterStage for RepeatFieldStage {
    fn kind(&self) -> StageKind {
        StageKind::RepeatField
    }

    fn name(&self) -> &str {
        "vpp-rff"
    }

    fn filter(&mut self, input: Option<&Frame>, out: &mut StageOutputs) -> Result<()> {
        let Some(frame) = input else { return Ok(()) };
        let mut f = derive(frame, self.ring.next()?, &self.out);
        if self.swapped {
            f.picstruct = match f.picstruct {
                PictureStructure::TopFieldFirst => PictureStructure::BottomFieldFirst,
                PictureStructure::BottomFieldFirst => PictureStructure::TopFieldFirst,
                p => p,
            };
        }
        if frame.flags.contains(FrameFlags::RFF) {
            self.swapped = !self.swapped;
        }
        f.flags.remove(FrameFlags::RFF_ALL);
        out.push(f)
    }
}

/// Filter-chain deinterlacing algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeinterlaceAlgorithm {
    Afs,
    Nnedi,
    Yadif,
}

impl DeinterlaceAlgorithm {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Afs => "afs",
            Self::Nnedi => "nnedi",
            Self::Yadif => "yadif",
        }
    }

    /// Whether the algorithm needs the next frame before emitting one.
    pub fn lookahead(&self) -> bool {
        matches!(self, Self::Yadif)
    }
}

#[derive(Debug)]
pub struct DeinterlaceStage {
    algorithm: DeinterlaceAlgorithm,
    double_rate: bool,
    out: FrameLayout,
    ring: SurfaceRing,
    held: Option<Frame>,
}

impl DeinterlaceStage {
    pub fn new(
        algorithm: DeinterlaceAlgorithm,
        double_rate: bool,
        out: FrameLayout,
        surfaces: Vec<Surface>,
    ) -> Self {
        Self {
            algorithm,
            double_rate,
            out,
            ring: SurfaceRing::new(surfaces),
            held: None,
        }
    }

    fn emit(&mut self, frame: &Frame, out: &mut StageOutputs) -> Result<()> {
        let mut first = derive(frame, self.ring.next()?, &self.out);
        first.flags.remove(FrameFlags::RFF_ALL);
        if !self.double_rate {
            return out.push(first);
        }
        let half = frame.duration / 2;
        let mut second = derive(frame, self.ring.next()?, &self.out);
        second.flags.remove(FrameFlags::RFF_ALL);
        first.duration = half;
        second.timestamp = frame.timestamp + half;
        second.duration = frame.duration - half;
        out.push(first)?;
        out.push(second)
    }
}

impl FilterStage for DeinterlaceStage {
    fn kind(&self) -> StageKind {
        StageKind::Deinterlace
    }

    fn name(&self) -> &str {
        self.algorithm.label()
    }

    fn filter(&mut self, input: Option<&Frame>, out: &mut StageOutputs) -> Result<()> {
        match input {
            Some(frame) if self.algorithm.lookahead() => match self.held.replace(frame.clone()) {
                Some(prev) => self.emit(&prev, out),
                None => Ok(()),
            },
            Some(frame) => self.emit(frame, out),
            None => match self.held.take() {
                Some(prev) => self.emit(&prev, out),
                None => Ok(()),
            },
        }
    }
}

// ─── Rate ────────────────────────────────────────────────────────────────

/// Keeps one frame out of every `step`; kept frames cover the dropped
/// ones' time.
#[derive(Debug)]
pub struct SelectEveryStage {
    sel: SelectEvery,
    seen: u64,
    name: String,
}

impl SelectEveryStage {
    pub fn new(sel: SelectEvery) -> Self {
        Self {
            name: format!("select-every {}", sel.step),
            sel,
            seen: 0,
        }
    }
}

impl FilterStage for SelectEveryStage {
    fn kind(&self) -> StageKind {
        StageKind::SelectEvery
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn filter(&mut self, input: Option<&Frame>, out: &mut StageOutputs) -> Result<()> {
        let Some(frame) = input else { return Ok(()) };
        let step = u64::from(self.sel.step.max(1));
        let keep = self.seen % step == u64::from(self.sel.offset);
        self.seen += 1;
        if !keep {
            return Ok(());
        }
        let mut f = frame.clone();
        f.duration = frame.duration.saturating_mul(step as i64);
        out.push(f)
    }
}

// ─── Terminal ────────────────────────────────────────────────────────────

/// Last stage: converts into the encode slot surface it is given.
#[derive(Debug)]
pub struct TerminalStage {
    kind: StageKind,
    name: String,
    out: FrameLayout,
}

impl TerminalStage {
    pub fn new(kind: StageKind, name: &str, out: FrameLayout) -> Self {
        Self {
            kind,
            name: name.to_string(),
            out,
        }
    }
}

impl FilterStage for TerminalStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn filter(&mut self, input: Option<&Frame>, out: &mut StageOutputs) -> Result<()> {
        let Some(frame) = input else { return Ok(()) };
        let target = out.target().ok_or_else(|| {
            EngineError::InvariantViolation(format!("{} ran without an encode slot", self.name))
        })?;
        if target.location != self.out.location {
            return Err(EngineError::InvariantViolation(format!(
                "{} writes {:?} memory, slot is {:?}",
                self.name, self.out.location, target.location
            )));
        }
        out.push(derive(frame, target, &self.out))
    }
}
