//! Filter chain: stage contract, fixed-precedence builder and runner.
//!
//! Building happens in two steps. [`FilterChainBuilder::plan`] decides the
//! stage list and checks every combination rule without allocating
//! anything; [`ChainPlan::instantiate`] then creates the stages and their
//! surfaces. A rejected feature set therefore never leaves a partially
//! initialized stage behind.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use hwtc_core::context::ContextLock;
use hwtc_core::error::{EngineError, Result};
use hwtc_core::types::{Frame, MemoryLocation, PictureStructure, PixelFormat, Rational, Surface};

use crate::stages::{
    ConvertStage, DeinterlaceAlgorithm, DeinterlaceStage, OverwriteStage, RepeatFieldStage,
    SelectEveryStage, TerminalStage,
};

/// Upper bound on frames one stage call may emit.
pub const MAX_STAGE_OUTPUTS: usize = 16;

// ─── Stage contract ──────────────────────────────────────────────────────

/// Stage kinds in chain order. The derived ordering is the precedence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Normalize,
    ColorSpace,
    CropFormat,
    RepeatField,
    Deinterlace,
    Delogo,
    SelectEvery,
    Denoise,
    Resize,
    Sharpen,
    Tweak,
    Deband,
    Subburn,
    Pad,
    EncoderFormat,
    DeviceToHost,
}

/// Output buffer for one stage call.
#[derive(Debug, Default)]
pub struct StageOutputs {
    frames: Vec<Frame>,
    target: Option<Surface>,
}

impl StageOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outputs for the terminal stage, which writes into `target`.
    pub fn with_target(target: Surface) -> Self {
        Self {
            frames: Vec::new(),
            target: Some(target),
        }
    }

    pub fn push(&mut self, frame: Frame) -> Result<()> {
        if self.frames.len() >= MAX_STAGE_OUTPUTS {
            return Err(EngineError::InvariantViolation(format!(
                "stage emitted more than {MAX_STAGE_OUTPUTS} frames for one input"
            )));
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn target(&self) -> Option<Surface> {
        self.target
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// One frame transform.
///
/// `filter(Some(frame), out)` maps one input to `0..=MAX_STAGE_OUTPUTS`
/// outputs; a stage may hold frames back and release them later.
/// `filter(None, out)` is drain mode: flush everything held. Timestamps and
/// durations pass through unless the stage recomputes them.
pub trait FilterStage: Send {
    fn kind(&self) -> StageKind;

    fn name(&self) -> &str;

    fn filter(&mut self, input: Option<&Frame>, out: &mut StageOutputs) -> Result<()>;
}

// ─── Feature flags ───────────────────────────────────────────────────────

/// Geometry, format and placement of frames at some point in the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLayout {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub picstruct: PictureStructure,
    pub location: MemoryLocation,
}

/// Deinterlacing done by the hardware decoder itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderDeinterlace {
    /// Fields passed through woven; repeat-field expansion applies.
    #[default]
    Weave,
    /// Each field becomes a frame of half duration.
    Bob,
    Adaptive,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Margins {
    #[serde(default)]
    pub left: u32,
    #[serde(default)]
    pub top: u32,
    #[serde(default)]
    pub right: u32,
    #[serde(default)]
    pub bottom: u32,
}

impl Margins {
    pub fn is_empty(&self) -> bool {
        self.left == 0 && self.top == 0 && self.right == 0 && self.bottom == 0
    }

    fn horizontal(&self) -> u32 {
        self.left + self.right
    }

    fn vertical(&self) -> u32 {
        self.top + self.bottom
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorMatrix {
    Bt601,
    Bt709,
    Bt2020,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorSpaceConversion {
    pub from: ColorMatrix,
    pub to: ColorMatrix,
}

/// Motion-adaptive field shift.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AfsOptions {
    /// Take frame timing from the source's repeat-field flags.
    #[serde(default)]
    pub rff: bool,
}

/// Neural-network field interpolation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NnediOptions {
    #[serde(default)]
    pub double_rate: bool,
    #[serde(default = "default_nnedi_neurons")]
    pub neurons: u32,
}

fn default_nnedi_neurons() -> u32 {
    32
}

/// Temporal deinterlacer; needs the following frame, so it runs one frame
/// behind its input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct YadifOptions {
    #[serde(default)]
    pub double_rate: bool,
}

/// Keep one frame out of every `step`, starting at `offset`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectEvery {
    pub step: u32,
    #[serde(default)]
    pub offset: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Denoise {
    Knn { radius: u32 },
    Pmd { iterations: u32 },
    Gauss { size: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resize {
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Sharpen {
    Unsharp { radius: u32, weight: f32 },
    Edgelevel { strength: f32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tweak {
    pub brightness: f32,
    pub contrast: f32,
    pub gamma: f32,
    pub hue: f32,
    pub saturation: f32,
}

impl Default for Tweak {
    fn default() -> Self {
        Self {
            brightness: 0.0,
            contrast: 1.0,
            gamma: 1.0,
            hue: 0.0,
            saturation: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deband {
    #[serde(default = "default_deband_range")]
    pub range: u32,
}

fn default_deband_range() -> u32 {
    15
}

/// Requested filters. Empty by default.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterFeatures {
    pub colorspace: Option<ColorSpaceConversion>,
    pub crop: Margins,
    pub repeat_field: bool,
    pub decoder_deinterlace: DecoderDeinterlace,
    pub afs: Option<AfsOptions>,
    pub nnedi: Option<NnediOptions>,
    pub yadif: Option<YadifOptions>,
    pub delogo: Option<PathBuf>,
    pub select_every: Option<SelectEvery>,
    pub denoise: Vec<Denoise>,
    pub resize: Option<Resize>,
    pub sharpen: Vec<Sharpen>,
    pub tweak: Option<Tweak>,
    pub deband: Option<Deband>,
    pub subburn: Option<PathBuf>,
    pub pad: Margins,
    /// Field order for sources that do not signal one.
    pub field_order: Option<PictureStructure>,
}

impl FilterFeatures {
    /// Names of every requested deinterlacer, decoder modes included.
    pub fn deinterlacers(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        match self.decoder_deinterlace {
            DecoderDeinterlace::Weave => {}
            DecoderDeinterlace::Bob => out.push("decoder bob"),
            DecoderDeinterlace::Adaptive => out.push("decoder adaptive"),
        }
        if self.afs.is_some() {
            out.push("afs");
        }
        if self.nnedi.is_some() {
            out.push("nnedi");
        }
        if self.yadif.is_some() {
            out.push("yadif");
        }
        out
    }

    /// Whether frame timing follows the source's repeat-field flags.
    pub fn rff_aware(&self) -> bool {
        self.repeat_field || self.afs.is_some_and(|a| a.rff)
    }

    fn filter_deinterlace(&self) -> Option<(DeinterlaceAlgorithm, bool)> {
        if self.afs.is_some() {
            Some((DeinterlaceAlgorithm::Afs, false))
        } else if let Some(n) = self.nnedi {
            Some((DeinterlaceAlgorithm::Nnedi, n.double_rate))
        } else {
            self.yadif.map(|y| (DeinterlaceAlgorithm::Yadif, y.double_rate))
        }
    }
}

// ─── Planning ────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum StageSpec {
    /// Writes a new surface, possibly changing geometry or format.
    Convert,
    /// Rewrites the input surface in place.
    Overwrite,
    RepeatField,
    Deinterlace {
        algorithm: DeinterlaceAlgorithm,
        double_rate: bool,
    },
    SelectEvery(SelectEvery),
    /// Writes into the encode slot surface.
    Terminal,
}

/// One planned stage.
#[derive(Clone, Debug, Serialize)]
pub struct StagePlan {
    pub kind: StageKind,
    pub name: String,
    pub input: FrameLayout,
    pub output: FrameLayout,
    #[serde(skip)]
    pub(crate) spec: StageSpec,
}

/// Validated stage list, not yet backed by any resource.
#[derive(Clone, Debug, Serialize)]
pub struct ChainPlan {
    pub stages: Vec<StagePlan>,
    pub input: FrameLayout,
    pub output: FrameLayout,
    /// Output frame rate relative to the source.
    pub rate_scale: Rational,
}

impl ChainPlan {
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Where encode slots must live for this chain's output.
    pub fn slot_location(&self) -> MemoryLocation {
        self.output.location
    }

    /// Create every stage. `ring_depth` surfaces back each converting stage.
    pub fn instantiate(
        &self,
        arena: &mut SurfaceArena,
        lock: Arc<ContextLock>,
        ring_depth: usize,
        check_performance: bool,
    ) -> Result<FilterChain> {
        let ring_depth = ring_depth.max(1);
        let mut stages: Vec<Box<dyn FilterStage>> = Vec::with_capacity(self.stages.len());
        for plan in &self.stages {
            let stage: Box<dyn FilterStage> = match &plan.spec {
                StageSpec::Convert => Box::new(ConvertStage::new(
                    plan.kind,
                    &plan.name,
                    plan.output,
                    arena.allocate_ring(&plan.output, ring_depth),
                )),
                StageSpec::Overwrite => Box::new(OverwriteStage::new(plan.kind, &plan.name)),
                StageSpec::RepeatField => Box::new(RepeatFieldStage::new(
                    plan.output,
                    arena.allocate_ring(&plan.output, ring_depth),
                )),
                StageSpec::Deinterlace {
                    algorithm,
                    double_rate,
                } => Box::new(DeinterlaceStage::new(
                    *algorithm,
                    *double_rate,
                    plan.output,
                    arena.allocate_ring(&plan.output, ring_depth + 1),
                )),
                StageSpec::SelectEvery(sel) => Box::new(SelectEveryStage::new(*sel)),
                StageSpec::Terminal => Box::new(TerminalStage::new(plan.kind, &plan.name, plan.output)),
            };
            stages.push(stage);
        }
        debug!(
            stages = stages.len(),
            surfaces = arena.allocated(),
            "Filter chain instantiated"
        );
        Ok(FilterChain::new(stages, lock, check_performance))
    }
}

/// Plans a filter chain from feature flags and the source layout.
#[derive(Clone, Debug)]
pub struct FilterChainBuilder<'a> {
    features: &'a FilterFeatures,
    input: FrameLayout,
    encoder_format: PixelFormat,
    host_slots_for_fields: bool,
}

impl<'a> FilterChainBuilder<'a> {
    pub fn new(features: &'a FilterFeatures, input: FrameLayout) -> Self {
        Self {
            features,
            input,
            encoder_format: PixelFormat::Nv12,
            host_slots_for_fields: true,
        }
    }

    /// Surface format the encoder consumes.
    pub fn encoder_format(mut self, format: PixelFormat) -> Self {
        self.encoder_format = format;
        self
    }

    /// Whether interlaced output needs host-resident encode slots.
    pub fn host_slots_for_fields(mut self, host: bool) -> Self {
        self.host_slots_for_fields = host;
        self
    }

    /// Decide the stage list and check every combination rule.
    pub fn plan(&self) -> Result<ChainPlan> {
        let f = self.features;
        let deinterlacers = f.deinterlacers();
        if deinterlacers.len() > 1 {
            return Err(EngineError::FilterConflict(format!(
                "only one deinterlacer may be used, requested {}",
                deinterlacers.join(", ")
            )));
        }
        let field_order = self.field_order();
        for (name, requested) in [
            ("vpp-rff", f.repeat_field),
            ("afs", f.afs.is_some()),
            ("nnedi", f.nnedi.is_some()),
            ("yadif", f.yadif.is_some()),
        ] {
            if requested && field_order.is_none() {
                return Err(EngineError::Config(format!(
                    "{name} requires interlaced input or a declared field order"
                )));
            }
        }
        if let Some(sel) = f.select_every
            && (sel.step == 0 || sel.offset >= sel.step)
        {
            return Err(EngineError::Config(format!(
                "select_every step {} offset {} is invalid",
                sel.step, sel.offset
            )));
        }

        let mut rate_scale = Rational::new(1, 1)?;
        let mut layout = FrameLayout {
            picstruct: field_order.unwrap_or(self.input.picstruct),
            ..self.input
        };
        if f.decoder_deinterlace != DecoderDeinterlace::Weave {
            layout.picstruct = PictureStructure::Progressive;
            if f.decoder_deinterlace == DecoderDeinterlace::Bob {
                rate_scale = rate_scale.mul(Rational::new(2, 1)?)?;
            }
        }
        let work_format = working_format(layout.format);

        let mut stages = Vec::new();
        let mut push = |kind: StageKind, name: String, spec: StageSpec, output: FrameLayout, layout: &mut FrameLayout| {
            stages.push(StagePlan {
                kind,
                name,
                input: *layout,
                output,
                spec,
            });
            *layout = output;
        };

        if layout.location != MemoryLocation::Device || layout.format != work_format {
            let out = FrameLayout {
                format: work_format,
                location: MemoryLocation::Device,
                ..layout
            };
            push(StageKind::Normalize, "normalize".into(), StageSpec::Convert, out, &mut layout);
        }
        if let Some(cs) = f.colorspace
            && cs.from != cs.to
        {
            push(
                StageKind::ColorSpace,
                format!("colorspace {:?}->{:?}", cs.from, cs.to).to_lowercase(),
                StageSpec::Convert,
                layout,
                &mut layout,
            );
        }
        if !f.crop.is_empty() {
            let (w, h) = shrink(&layout, &f.crop)?;
            let out = FrameLayout {
                width: w,
                height: h,
                ..layout
            };
            push(StageKind::CropFormat, "crop".into(), StageSpec::Convert, out, &mut layout);
        }
        if f.repeat_field {
            push(
                StageKind::RepeatField,
                "vpp-rff".into(),
                StageSpec::RepeatField,
                layout,
                &mut layout,
            );
        }
        if let Some((algorithm, double_rate)) = f.filter_deinterlace() {
            let out = FrameLayout {
                picstruct: PictureStructure::Progressive,
                ..layout
            };
            push(
                StageKind::Deinterlace,
                algorithm.label().into(),
                StageSpec::Deinterlace {
                    algorithm,
                    double_rate,
                },
                out,
                &mut layout,
            );
            if double_rate {
                rate_scale = rate_scale.mul(Rational::new(2, 1)?)?;
            }
        }
        if f.delogo.is_some() {
            push(StageKind::Delogo, "delogo".into(), StageSpec::Overwrite, layout, &mut layout);
        }
        if let Some(sel) = f.select_every {
            push(
                StageKind::SelectEvery,
                format!("select-every {}", sel.step),
                StageSpec::SelectEvery(sel),
                layout,
                &mut layout,
            );
            rate_scale = rate_scale.mul(Rational::new(1, i64::from(sel.step))?)?;
        }
        for d in &f.denoise {
            let name = match d {
                Denoise::Knn { .. } => "denoise-knn",
                Denoise::Pmd { .. } => "denoise-pmd",
                Denoise::Gauss { .. } => "denoise-gauss",
            };
            push(StageKind::Denoise, name.into(), StageSpec::Convert, layout, &mut layout);
        }
        if let Some(r) = f.resize
            && (r.width, r.height) != (layout.width, layout.height)
        {
            if r.width == 0 || r.height == 0 {
                return Err(EngineError::Config(format!(
                    "resize target {}x{} is empty",
                    r.width, r.height
                )));
            }
            let out = FrameLayout {
                width: r.width,
                height: r.height,
                ..layout
            };
            push(StageKind::Resize, "resize".into(), StageSpec::Convert, out, &mut layout);
        }
        for s in &f.sharpen {
            let name = match s {
                Sharpen::Unsharp { .. } => "unsharp",
                Sharpen::Edgelevel { .. } => "edgelevel",
            };
            push(StageKind::Sharpen, name.into(), StageSpec::Convert, layout, &mut layout);
        }
        if f.tweak.is_some() {
            push(StageKind::Tweak, "tweak".into(), StageSpec::Overwrite, layout, &mut layout);
        }
        if f.deband.is_some() {
            push(StageKind::Deband, "deband".into(), StageSpec::Convert, layout, &mut layout);
        }
        if f.subburn.is_some() {
            push(StageKind::Subburn, "subburn".into(), StageSpec::Overwrite, layout, &mut layout);
        }
        if !f.pad.is_empty() {
            let out = FrameLayout {
                width: layout.width + f.pad.horizontal(),
                height: layout.height + f.pad.vertical(),
                ..layout
            };
            push(StageKind::Pad, "pad".into(), StageSpec::Convert, out, &mut layout);
        }

        let to_host = self.host_slots_for_fields && layout.picstruct.is_interlaced();
        let encoder_out = FrameLayout {
            format: self.encoder_format,
            ..layout
        };
        if to_host {
            push(
                StageKind::EncoderFormat,
                "encoder-format".into(),
                StageSpec::Convert,
                encoder_out,
                &mut layout,
            );
            let out = FrameLayout {
                location: MemoryLocation::Host,
                ..layout
            };
            push(StageKind::DeviceToHost, "device-to-host".into(), StageSpec::Terminal, out, &mut layout);
        } else {
            push(
                StageKind::EncoderFormat,
                "encoder-format".into(),
                StageSpec::Terminal,
                encoder_out,
                &mut layout,
            );
        }

        debug_assert!(stages.windows(2).all(|w| w[0].kind <= w[1].kind));
        let plan = ChainPlan {
            stages,
            input: self.input,
            output: layout,
            rate_scale,
        };
        debug!(stages = ?plan.stage_names(), output = ?plan.output, "Filter chain planned");
        Ok(plan)
    }

    fn field_order(&self) -> Option<PictureStructure> {
        if self.input.picstruct.is_interlaced() {
            Some(self.input.picstruct)
        } else {
            self.features.field_order.filter(|p| p.is_interlaced())
        }
    }
}

/// Device-native format the chain works in for a source format.
fn working_format(format: PixelFormat) -> PixelFormat {
    match format {
        PixelFormat::Yv12 => PixelFormat::Nv12,
        PixelFormat::Yv12High => PixelFormat::P010,
        other => other,
    }
}

fn shrink(layout: &FrameLayout, crop: &Margins) -> Result<(u32, u32)> {
    let w = layout.width.checked_sub(crop.horizontal()).filter(|&w| w > 0);
    let h = layout.height.checked_sub(crop.vertical()).filter(|&h| h > 0);
    match (w, h) {
        (Some(w), Some(h)) => Ok((w, h)),
        _ => Err(EngineError::Config(format!(
            "crop {crop:?} leaves nothing of {}x{}",
            layout.width, layout.height
        ))),
    }
}

// ─── Surfaces ────────────────────────────────────────────────────────────

/// Hands out stage surfaces and counts them.
#[derive(Debug)]
pub struct SurfaceArena {
    next_id: u64,
    allocated: usize,
    bytes: usize,
}

impl Default for SurfaceArena {
    fn default() -> Self {
        Self::new()
    }
}

impl SurfaceArena {
    pub fn new() -> Self {
        Self {
            next_id: 0x10_0000,
            allocated: 0,
            bytes: 0,
        }
    }

    pub fn allocate(&mut self, layout: &FrameLayout) -> Surface {
        let sample_bytes = if layout.format.bit_depth() > 8 { 2 } else { 1 };
        let pitch = layout.width.next_multiple_of(256) * sample_bytes;
        let surface = Surface {
            id: self.next_id,
            location: layout.location,
            pitch,
        };
        self.next_id += 1;
        self.allocated += 1;
        self.bytes += layout.format.frame_bytes(pitch / sample_bytes, layout.height);
        surface
    }

    pub fn allocate_ring(&mut self, layout: &FrameLayout, depth: usize) -> Vec<Surface> {
        (0..depth).map(|_| self.allocate(layout)).collect()
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

// ─── Runner ──────────────────────────────────────────────────────────────

/// Call count and elapsed time of one stage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub name: String,
    pub calls: u64,
    pub total_us: u64,
}

impl StageTiming {
    pub fn avg_us(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_us as f64 / self.calls as f64
        }
    }
}

/// Instantiated chain. The last stage always writes into an encode slot.
pub struct FilterChain {
    stages: Vec<Box<dyn FilterStage>>,
    timing: Vec<StageTiming>,
    lock: Arc<ContextLock>,
    check_performance: bool,
}

impl FilterChain {
    pub fn new(stages: Vec<Box<dyn FilterStage>>, lock: Arc<ContextLock>, check_performance: bool) -> Self {
        let timing = stages
            .iter()
            .map(|s| StageTiming {
                name: s.name().to_string(),
                ..StageTiming::default()
            })
            .collect();
        Self {
            stages,
            timing,
            lock,
            check_performance,
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run one frame (or a drain when `None`) through every stage but the
    /// terminal one. Returns the frames that now need an encode slot.
    pub fn process(&mut self, input: Option<&Frame>) -> Result<Vec<Frame>> {
        let mut ready = Vec::new();
        self.push(0, input, &mut ready)?;
        Ok(ready)
    }

    /// Run the terminal stage, writing `frame` into `target`.
    pub fn write_target(&mut self, frame: &Frame, target: Surface) -> Result<Frame> {
        let last = self
            .stages
            .len()
            .checked_sub(1)
            .ok_or_else(|| EngineError::InvariantViolation("filter chain has no stages".into()))?;
        let mut out = StageOutputs::with_target(target);
        self.run_stage(last, Some(frame), &mut out)?;
        let mut frames = out.into_frames();
        match (frames.pop(), frames.is_empty()) {
            (Some(f), true) => Ok(f),
            _ => Err(EngineError::InvariantViolation(
                "terminal stage must emit exactly one frame".into(),
            )),
        }
    }

    fn push(&mut self, idx: usize, input: Option<&Frame>, ready: &mut Vec<Frame>) -> Result<()> {
        if idx + 1 >= self.stages.len() {
            ready.extend(input.cloned());
            return Ok(());
        }
        let mut out = StageOutputs::new();
        self.run_stage(idx, input, &mut out)?;
        for frame in out.frames() {
            self.push(idx + 1, Some(frame), ready)?;
        }
        if input.is_none() {
            self.push(idx + 1, None, ready)?;
        }
        Ok(())
    }

    fn run_stage(&mut self, idx: usize, input: Option<&Frame>, out: &mut StageOutputs) -> Result<()> {
        let start = self.check_performance.then(Instant::now);
        {
            let _ctx = self.lock.enter()?;
            self.stages[idx].filter(input, out)?;
        }
        let t = &mut self.timing[idx];
        t.calls += 1;
        if let Some(start) = start {
            t.total_us += start.elapsed().as_micros() as u64;
        }
        Ok(())
    }

    pub fn timings(&self) -> &[StageTiming] {
        &self.timing
    }

    /// Log the average time per call of each stage.
    pub fn log_timing(&self) {
        if !self.check_performance {
            return;
        }
        for t in &self.timing {
            info!(stage = %t.name, calls = t.calls, avg_us = t.avg_us(), "Filter stage timing");
        }
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("stages", &self.stage_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hwtc_core::types::FrameFlags;

    fn layout(picstruct: PictureStructure) -> FrameLayout {
        FrameLayout {
            width: 1920,
            height: 1080,
            format: PixelFormat::Nv12,
            picstruct,
            location: MemoryLocation::Device,
        }
    }

    fn frame(ts: i64, id: u64) -> Frame {
        Frame {
            surface: Surface {
                id: 1,
                location: MemoryLocation::Device,
                pitch: 2048,
            },
            width: 1920,
            height: 1080,
            format: PixelFormat::Nv12,
            picstruct: PictureStructure::Progressive,
            flags: FrameFlags::empty(),
            timestamp: ts,
            duration: 4,
            input_frame_id: id,
        }
    }

    #[test]
    fn minimal_chain_is_encoder_format_only() {
        let features = FilterFeatures::default();
        let plan = FilterChainBuilder::new(&features, layout(PictureStructure::Progressive))
            .plan()
            .unwrap();
        assert_eq!(plan.stage_names(), vec!["encoder-format"]);
        assert_eq!(plan.slot_location(), MemoryLocation::Device);
        assert_eq!(plan.rate_scale, Rational::new(1, 1).unwrap());
    }

    #[test]
    fn stages_follow_precedence() {
        let features = FilterFeatures {
            crop: Margins {
                top: 4,
                bottom: 4,
                ..Margins::default()
            },
            tweak: Some(Tweak::default()),
            resize: Some(Resize {
                width: 1280,
                height: 720,
            }),
            denoise: vec![Denoise::Knn { radius: 3 }],
            pad: Margins {
                left: 8,
                right: 8,
                ..Margins::default()
            },
            ..FilterFeatures::default()
        };
        let input = FrameLayout {
            format: PixelFormat::Yv12,
            location: MemoryLocation::Host,
            ..layout(PictureStructure::Progressive)
        };
        let plan = FilterChainBuilder::new(&features, input).plan().unwrap();
        let kinds: Vec<StageKind> = plan.stages.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StageKind::Normalize,
                StageKind::CropFormat,
                StageKind::Denoise,
                StageKind::Resize,
                StageKind::Tweak,
                StageKind::Pad,
                StageKind::EncoderFormat,
            ]
        );
        assert_eq!((plan.output.width, plan.output.height), (1296, 720));
        assert_eq!(plan.stages[1].output.height, 1072);
    }

    #[test]
    fn two_deinterlacers_conflict_without_allocating() {
        let features = FilterFeatures {
            afs: Some(AfsOptions::default()),
            yadif: Some(YadifOptions::default()),
            ..FilterFeatures::default()
        };
        let mut arena = SurfaceArena::new();
        let err = FilterChainBuilder::new(&features, layout(PictureStructure::TopFieldFirst))
            .plan()
            .and_then(|plan| plan.instantiate(&mut arena, Arc::new(ContextLock::new()), 2, true))
            .err()
            .expect("conflict");
        assert!(matches!(err, EngineError::FilterConflict(_)));
        assert!(err.to_string().contains("afs, yadif"));
        assert_eq!(arena.allocated(), 0);
        assert_eq!(arena.bytes(), 0);

        // The same ring allocates once the conflict is gone.
        let yadif_only = FilterFeatures {
            afs: None,
            ..features
        };
        FilterChainBuilder::new(&yadif_only, layout(PictureStructure::TopFieldFirst))
            .plan()
            .and_then(|plan| plan.instantiate(&mut arena, Arc::new(ContextLock::new()), 2, true))
            .unwrap();
        assert!(arena.allocated() > 0);
    }

    #[test]
    fn decoder_bob_counts_as_deinterlacer() {
        let features = FilterFeatures {
            decoder_deinterlace: DecoderDeinterlace::Bob,
            nnedi: Some(NnediOptions {
                double_rate: false,
                neurons: 32,
            }),
            ..FilterFeatures::default()
        };
        let err = FilterChainBuilder::new(&features, layout(PictureStructure::TopFieldFirst))
            .plan()
            .expect_err("conflict");
        assert!(err.to_string().contains("decoder bob"));
    }

    #[test]
    fn field_filter_needs_field_order() {
        let features = FilterFeatures {
            yadif: Some(YadifOptions::default()),
            ..FilterFeatures::default()
        };
        let err = FilterChainBuilder::new(&features, layout(PictureStructure::Progressive))
            .plan()
            .expect_err("progressive input");
        assert!(err.to_string().contains("yadif requires"));

        let declared = FilterFeatures {
            field_order: Some(PictureStructure::TopFieldFirst),
            ..features
        };
        let plan = FilterChainBuilder::new(&declared, layout(PictureStructure::Progressive))
            .plan()
            .unwrap();
        assert_eq!(plan.output.picstruct, PictureStructure::Progressive);
    }

    #[test]
    fn interlaced_output_appends_host_copy() {
        let features = FilterFeatures::default();
        let plan = FilterChainBuilder::new(&features, layout(PictureStructure::BottomFieldFirst))
            .plan()
            .unwrap();
        assert_eq!(plan.stage_names(), vec!["encoder-format", "device-to-host"]);
        assert_eq!(plan.slot_location(), MemoryLocation::Host);
    }

    #[test]
    fn rate_scale_tracks_double_rate_and_selection() {
        let features = FilterFeatures {
            yadif: Some(YadifOptions { double_rate: true }),
            select_every: Some(SelectEvery { step: 4, offset: 1 }),
            ..FilterFeatures::default()
        };
        let plan = FilterChainBuilder::new(&features, layout(PictureStructure::TopFieldFirst))
            .plan()
            .unwrap();
        assert_eq!(plan.rate_scale, Rational::new(1, 2).unwrap());
    }

    #[test]
    fn drain_flushes_buffering_stage() {
        let features = FilterFeatures {
            yadif: Some(YadifOptions::default()),
            ..FilterFeatures::default()
        };
        let plan = FilterChainBuilder::new(&features, layout(PictureStructure::TopFieldFirst))
            .host_slots_for_fields(false)
            .plan()
            .unwrap();
        let mut arena = SurfaceArena::new();
        let mut chain = plan
            .instantiate(&mut arena, Arc::new(ContextLock::new()), 2, true)
            .unwrap();
        assert!(arena.allocated() > 0);
        assert!(chain.process(Some(&frame(0, 0))).unwrap().is_empty());
        let out = chain.process(Some(&frame(4, 1))).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp, 0);
        let flushed = chain.process(None).unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].input_frame_id, 1);

        let target = Surface {
            id: 77,
            location: MemoryLocation::Device,
            pitch: 2048,
        };
        let written = chain.write_target(&flushed[0], target).unwrap();
        assert_eq!(written.surface, target);
        assert_eq!(written.timestamp, 4);
        assert_eq!(chain.timings()[0].calls, 3);
    }
}
