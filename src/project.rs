use std::path::Path;

use egui::{Pos2, Vec2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::canvas::RasterImage;
use crate::components::history::EditHistoryStore;
use crate::components::layers::{LayerStack, flatten};
use crate::components::mask::{BrushSettings, MaskCompositor, MaskTool};
use crate::error::{EditError, EditResult};
use crate::io::{self, ExportFormat};
use crate::ops::ai::{EditGenerator, EditRequest, EditTarget, GenerateError};
use crate::ops::background::{BackgroundFill, FitMode, clean_foreground, composite_onto_background};
use crate::ops::transform::{self, CropRegion, clamp_straighten};
use crate::ops::watermark::{self, WatermarkSettings};
use crate::settings::EngineSettings;
use crate::store::{FileSessionStore, SessionStore};
use crate::viewport::{MappedPoint, ViewportLayout, ViewportTransform, WheelOutcome};

// ============================================================================
// TOOLS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    #[default]
    Hotspot,
    Mask,
    Layers,
    Background,
    Crop,
    Watermark,
    Export,
}

impl ToolKind {
    pub fn all() -> &'static [ToolKind] {
        &[
            ToolKind::Hotspot,
            ToolKind::Mask,
            ToolKind::Layers,
            ToolKind::Background,
            ToolKind::Crop,
            ToolKind::Watermark,
            ToolKind::Export,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::Hotspot => "hotspot",
            ToolKind::Mask => "mask",
            ToolKind::Layers => "layers",
            ToolKind::Background => "background",
            ToolKind::Crop => "crop",
            ToolKind::Watermark => "watermark",
            ToolKind::Export => "export",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::all().iter().copied().find(|t| t.name() == name)
    }
}

/// A selected point, kept in both frames: natural pixels for requests,
/// display pixels for the on-screen marker.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hotspot {
    pub natural: Pos2,
    pub display: Pos2,
}

impl From<MappedPoint> for Hotspot {
    fn from(p: MappedPoint) -> Self {
        Self {
            natural: p.natural,
            display: p.display,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointerTarget {
    Image,
    /// The before/after comparison splitter.
    Splitter,
}

/// The drag in progress. Only one runs per pointer-down/up cycle.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum Gesture {
    #[default]
    Idle,
    Pan {
        last: Pos2,
    },
    HotspotDrag,
    MaskStroke,
    CropDrag {
        anchor: Pos2,
    },
    Splitter,
}

/// Transient per-edit tool state. Wiped on every history mutation.
pub struct ToolState {
    pub hotspot: Option<Hotspot>,
    pub mask: MaskCompositor,
    pub crop: Option<CropRegion>,
    /// Straightening angle in degrees.
    pub rotation: f32,
    pub layers: LayerStack,
    pub view: ViewportTransform,
    pub gesture: Gesture,
    /// Before/after splitter position, 0.0–1.0 of the container width.
    pub compare_split: f32,
}

impl ToolState {
    fn new(settings: &EngineSettings) -> Self {
        Self {
            hotspot: None,
            mask: MaskCompositor::with_settings(0, 0, settings.mask.brush, settings.mask.color()),
            crop: None,
            rotation: 0.0,
            layers: LayerStack::new(),
            view: ViewportTransform::new(),
            gesture: Gesture::Idle,
            compare_split: 0.5,
        }
    }

    /// Clear everything tied to the raster currently shown.
    pub fn reset(&mut self) {
        self.hotspot = None;
        self.mask.clear();
        self.crop = None;
        self.rotation = 0.0;
        self.layers.clear();
        self.view.reset();
        self.gesture = Gesture::Idle;
    }
}

// ============================================================================
// COMMANDS
// ============================================================================

/// Input events and UI actions, applied in order by [`Project::apply`].
#[derive(Clone, Debug, PartialEq)]
pub enum SessionCommand {
    SelectTool(ToolKind),
    SetPrompt(String),
    SetLayout {
        layout: ViewportLayout,
        device_pixel_ratio: f32,
    },
    PointerDown {
        pos: Pos2,
        target: PointerTarget,
    },
    PointerMove {
        pos: Pos2,
    },
    PointerUp {
        pos: Pos2,
    },
    Wheel {
        pos: Pos2,
        delta_y: f32,
    },
    SetMaskTool(MaskTool),
    SetBrush(BrushSettings),
    ClearMask,
    SetCropRegion(Option<CropRegion>),
    SetRotation(f32),
    ResetView,
    Undo,
    Redo,
    SelectIndex(usize),
    ResetToOriginal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    Changed,
    Unchanged,
    /// The event was not consumed; the host should handle it (page scroll).
    PassThrough,
}

// ============================================================================
// REMOTE EDITS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingKind {
    /// The returned raster replaces the current one.
    Replace,
    /// The returned raster is a cut-out; flat backgrounds are keyed out.
    CleanForeground,
    /// The returned raster is a new background for the request image.
    BackgroundFill(FitMode),
}

/// Ticket for the one request allowed in flight. Consumed by
/// [`Project::finish_remote_edit`], or by [`Project::abandon_remote_edit`]
/// when the request is cancelled; dropping it keeps the project busy.
#[derive(Debug)]
pub struct PendingEdit {
    ticket: u64,
    pub request: EditRequest,
    pub label: String,
    pub kind: PendingKind,
}

// ============================================================================
// PROJECT
// ============================================================================

/// One editing session: history, tool state and the busy lock.
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub history: EditHistoryStore,
    pub tools: ToolState,
    pub settings: EngineSettings,
    active_tool: ToolKind,
    prompt: String,
    layout: Option<ViewportLayout>,
    device_pixel_ratio: f32,
    in_flight: Option<u64>,
    next_ticket: u64,
}

impl Project {
    pub fn new(name: impl Into<String>, store: Box<dyn SessionStore>, settings: EngineSettings) -> Self {
        Self::with_id(Uuid::new_v4(), name, store, settings)
    }

    pub fn with_id(id: Uuid, name: impl Into<String>, store: Box<dyn SessionStore>, settings: EngineSettings) -> Self {
        let tools = ToolState::new(&settings);
        let mut history = EditHistoryStore::new(store);
        history.set_session_meta(ToolKind::default().name(), "");
        Self {
            id,
            name: name.into(),
            history,
            tools,
            settings,
            active_tool: ToolKind::default(),
            prompt: String::new(),
            layout: None,
            device_pixel_ratio: 1.0,
            in_flight: None,
            next_ticket: 0,
        }
    }

    /// Open the file-backed session `id` under the configured store root.
    pub fn open_file_session(id: Uuid, name: impl Into<String>, settings: EngineSettings) -> EditResult<Self> {
        let store = FileSessionStore::open(&settings.store_root(), id)?;
        Ok(Self::with_id(id, name, Box::new(store), settings))
    }

    pub fn active_tool(&self) -> ToolKind {
        self.active_tool
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn layout(&self) -> Option<&ViewportLayout> {
        self.layout.as_ref()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn current(&self) -> Option<&RasterImage> {
        self.history.current()
    }

    pub fn original(&self) -> Option<&RasterImage> {
        self.history.original()
    }

    /// Display→natural factor per axis (1:1 without a layout).
    pub fn display_to_natural(&self) -> Vec2 {
        self.layout.map(|l| l.display_to_natural()).unwrap_or(Vec2::splat(1.0))
    }

    /// Where the hotspot marker should be drawn, in screen coordinates.
    pub fn hotspot_screen_position(&self) -> Option<Pos2> {
        let hotspot = self.tools.hotspot?;
        match &self.layout {
            Some(layout) => Some(self.tools.view.natural_to_screen(layout, hotspot.natural)),
            None => Some(hotspot.display),
        }
    }

    fn ensure_idle(&self) -> EditResult<()> {
        if self.is_busy() { Err(EditError::Busy) } else { Ok(()) }
    }

    fn require_image(&self) -> EditResult<RasterImage> {
        self.history.current().cloned().ok_or(EditError::NoImage)
    }

    // ========================================================================
    // COMMAND DISPATCH
    // ========================================================================

    pub fn apply(&mut self, command: SessionCommand) -> EditResult<CommandOutcome> {
        use CommandOutcome::*;
        match command {
            SessionCommand::SelectTool(tool) => {
                if tool == self.active_tool {
                    return Ok(Unchanged);
                }
                self.tools.hotspot = None;
                self.tools.gesture = Gesture::Idle;
                self.active_tool = tool;
                debug!(tool = tool.name(), "tool selected");
                self.persist_descriptor();
                Ok(Changed)
            }
            SessionCommand::SetPrompt(prompt) => {
                self.prompt = prompt;
                self.persist_descriptor();
                Ok(Changed)
            }
            SessionCommand::SetLayout {
                layout,
                device_pixel_ratio,
            } => {
                self.layout = Some(layout);
                if device_pixel_ratio > 0.0 {
                    self.device_pixel_ratio = device_pixel_ratio;
                }
                self.sync_mask_size();
                Ok(Changed)
            }
            SessionCommand::PointerDown { pos, target } => Ok(self.pointer_down(pos, target)),
            SessionCommand::PointerMove { pos } => Ok(self.pointer_move(pos)),
            SessionCommand::PointerUp { pos } => Ok(self.pointer_up(pos)),
            SessionCommand::Wheel { pos, delta_y } => {
                let Some(layout) = self.layout else { return Ok(PassThrough) };
                match self
                    .tools
                    .view
                    .handle_wheel(&layout, pos, delta_y, self.settings.view.wheel_step)
                {
                    WheelOutcome::Consumed => Ok(Changed),
                    WheelOutcome::PassThrough => Ok(PassThrough),
                }
            }
            SessionCommand::SetMaskTool(tool) => {
                self.tools.mask.set_tool(tool);
                Ok(Changed)
            }
            SessionCommand::SetBrush(brush) => {
                self.tools.mask.set_brush(brush);
                Ok(Changed)
            }
            SessionCommand::ClearMask => {
                self.tools.mask.clear();
                Ok(Changed)
            }
            SessionCommand::SetCropRegion(region) => {
                let bounds = self.display_size();
                self.tools.crop = region.map(|r| r.clamped_to(bounds));
                Ok(Changed)
            }
            SessionCommand::SetRotation(degrees) => {
                self.tools.rotation = clamp_straighten(degrees);
                Ok(Changed)
            }
            SessionCommand::ResetView => {
                self.tools.view.reset();
                Ok(Changed)
            }
            SessionCommand::Undo => {
                self.ensure_idle()?;
                let moved = self.history.undo();
                Ok(self.after_navigation(moved))
            }
            SessionCommand::Redo => {
                self.ensure_idle()?;
                let moved = self.history.redo();
                Ok(self.after_navigation(moved))
            }
            SessionCommand::SelectIndex(index) => {
                self.ensure_idle()?;
                if index == self.history.pointer() && !self.history.is_empty() {
                    return Ok(Unchanged);
                }
                self.history.select_index(index)?;
                Ok(self.after_navigation(true))
            }
            SessionCommand::ResetToOriginal => {
                self.ensure_idle()?;
                let moved = self.history.reset_to_original();
                Ok(self.after_navigation(moved))
            }
        }
    }

    fn after_navigation(&mut self, moved: bool) -> CommandOutcome {
        if !moved {
            return CommandOutcome::Unchanged;
        }
        self.tools.reset();
        self.refresh_layout();
        self.sync_mask_size();
        self.persist_descriptor();
        CommandOutcome::Changed
    }

    // ========================================================================
    // POINTER GESTURES
    // ========================================================================

    /// Pointer → display/natural coordinates, `None` outside the image.
    fn map_pointer(&self, pos: Pos2) -> Option<MappedPoint> {
        match &self.layout {
            Some(layout) => self.tools.view.map_pointer_to_coordinates(layout, pos),
            None => {
                let (w, h) = self.history.current()?.dimensions();
                (pos.x >= 0.0 && pos.y >= 0.0 && pos.x < w as f32 && pos.y < h as f32)
                    .then_some(MappedPoint { display: pos, natural: pos })
            }
        }
    }

    /// Display coordinates without bounds checks, for drags that leave the
    /// image while the pointer is captured.
    fn display_point(&self, pos: Pos2) -> Pos2 {
        match &self.layout {
            Some(layout) => {
                let fitted = layout.fitted_image_rect();
                let content = self.tools.view.container_to_content((pos - layout.container.min).to_pos2());
                (content - fitted.min).to_pos2()
            }
            None => pos,
        }
    }

    fn display_size(&self) -> Vec2 {
        match (&self.layout, self.history.current()) {
            (Some(layout), _) => layout.rendered_size(),
            (None, Some(img)) => Vec2::new(img.width() as f32, img.height() as f32),
            (None, None) => Vec2::ZERO,
        }
    }

    /// Keep the layout's natural size in step with the current image.
    fn refresh_layout(&mut self) {
        if let (Some(layout), Some(img)) = (self.layout.as_mut(), self.history.current()) {
            *layout = ViewportLayout::new(layout.container, img.width(), img.height());
        }
    }

    fn sync_mask_size(&mut self) {
        let size = self.display_size();
        self.tools
            .mask
            .resize_working(size.x.round().max(0.0) as u32, size.y.round().max(0.0) as u32);
    }

    fn pointer_down(&mut self, pos: Pos2, target: PointerTarget) -> CommandOutcome {
        if self.tools.gesture != Gesture::Idle {
            return CommandOutcome::Unchanged;
        }
        if target == PointerTarget::Splitter {
            self.tools.gesture = Gesture::Splitter;
            self.update_split(pos);
            return CommandOutcome::Changed;
        }
        if self.history.is_empty() {
            return CommandOutcome::Unchanged;
        }

        let mapped = self.map_pointer(pos);
        self.tools.gesture = match (self.active_tool, mapped) {
            (ToolKind::Hotspot, Some(point)) => {
                self.tools.hotspot = Some(point.into());
                Gesture::HotspotDrag
            }
            (ToolKind::Mask, Some(point)) => {
                let tool = self.tools.mask.tool();
                self.tools.mask.begin_stroke(tool, point.display);
                Gesture::MaskStroke
            }
            (ToolKind::Crop, Some(point)) => Gesture::CropDrag { anchor: point.display },
            _ if self.tools.view.scale() > 1.0 => Gesture::Pan { last: pos },
            _ => Gesture::Idle,
        };
        if self.tools.gesture == Gesture::Idle {
            CommandOutcome::Unchanged
        } else {
            CommandOutcome::Changed
        }
    }

    fn pointer_move(&mut self, pos: Pos2) -> CommandOutcome {
        match self.tools.gesture {
            Gesture::Idle => return CommandOutcome::Unchanged,
            Gesture::Pan { last } => {
                self.tools.view.pan_by(pos - last);
                self.tools.gesture = Gesture::Pan { last: pos };
            }
            Gesture::HotspotDrag => {
                if let Some(point) = self.map_pointer(pos) {
                    self.tools.hotspot = Some(point.into());
                }
            }
            Gesture::MaskStroke => {
                let display = self.display_point(pos);
                self.tools.mask.continue_stroke(display);
            }
            Gesture::CropDrag { anchor } => {
                let corner = self.display_point(pos);
                let region = CropRegion::from_corners(anchor, corner).clamped_to(self.display_size());
                self.tools.crop = Some(region);
            }
            Gesture::Splitter => self.update_split(pos),
        }
        CommandOutcome::Changed
    }

    fn pointer_up(&mut self, pos: Pos2) -> CommandOutcome {
        let gesture = std::mem::take(&mut self.tools.gesture);
        match gesture {
            Gesture::Idle => CommandOutcome::Unchanged,
            Gesture::MaskStroke => {
                let display = self.display_point(pos);
                self.tools.mask.continue_stroke(display);
                self.tools.mask.end_stroke();
                CommandOutcome::Changed
            }
            Gesture::CropDrag { anchor } => {
                let corner = self.display_point(pos);
                let region = CropRegion::from_corners(anchor, corner).clamped_to(self.display_size());
                self.tools.crop = (!region.is_empty()).then_some(region);
                CommandOutcome::Changed
            }
            _ => CommandOutcome::Changed,
        }
    }

    fn update_split(&mut self, pos: Pos2) {
        if let Some(layout) = &self.layout {
            let width = layout.container.width();
            if width > 0.0 {
                self.tools.compare_split = ((pos.x - layout.container.min.x) / width).clamp(0.0, 1.0);
            }
        }
    }

    // ========================================================================
    // LOCAL EDITS
    // ========================================================================

    /// Start a fresh history from an uploaded image. The previous session
    /// survives if the new original cannot be stored.
    pub fn load_image(&mut self, raster: RasterImage, label: impl Into<String>) -> EditResult<usize> {
        self.ensure_idle()?;
        let index = self.history.start_over(raster, label)?;
        self.after_commit();
        info!(session = %self.id, "image loaded");
        Ok(index)
    }

    /// Decode and load an image file.
    pub fn load_file(&mut self, path: &Path) -> EditResult<usize> {
        let raster = io::load_image_sync(path)?;
        let label = path
            .file_name()
            .map(|s| format!("Open {}", s.to_string_lossy()))
            .unwrap_or_else(|| "Open".to_string());
        self.load_image(raster, label)
    }

    /// Commit a raster produced outside the engine.
    pub fn commit_edit(&mut self, raster: RasterImage, label: impl Into<String>) -> EditResult<usize> {
        self.ensure_idle()?;
        self.require_image()?;
        self.commit(raster, label)
    }

    /// Persist then reset transient state. Callers check the busy lock.
    fn commit(&mut self, raster: RasterImage, label: impl Into<String>) -> EditResult<usize> {
        let index = self.history.commit(raster, label)?;
        self.after_commit();
        Ok(index)
    }

    fn after_commit(&mut self) {
        self.tools.reset();
        self.refresh_layout();
        self.sync_mask_size();
    }

    pub fn apply_layers(&mut self) -> EditResult<usize> {
        self.ensure_idle()?;
        let base = self.require_image()?;
        if self.tools.layers.is_empty() {
            return Err(EditError::NoSelection);
        }
        let flattened = flatten(&base, self.tools.layers.iter());
        self.commit(flattened, "Layers")
    }

    /// Apply the pending crop region and straightening angle. Returns the
    /// current pointer unchanged when there is nothing to do.
    pub fn apply_crop(&mut self) -> EditResult<usize> {
        self.ensure_idle()?;
        let image = self.require_image()?;
        let bounds = self.display_size();
        let region = self
            .tools
            .crop
            .map(|r| r.clamped_to(bounds))
            .filter(|r| !r.is_empty());
        if region.is_none() && self.tools.rotation == 0.0 {
            return Ok(self.history.pointer());
        }
        let out = transform::crop_rotate(
            &image,
            region,
            self.tools.rotation,
            self.display_to_natural(),
            self.device_pixel_ratio,
        );
        if out.shares_pixels_with(&image) {
            return Ok(self.history.pointer());
        }
        let label = if self.tools.rotation != 0.0 { "Crop & straighten" } else { "Crop" };
        self.commit(out, label)
    }

    /// Exact ±90°/180° turns; positive is clockwise.
    pub fn rotate_quarter(&mut self, turns: i32) -> EditResult<usize> {
        self.ensure_idle()?;
        let image = self.require_image()?;
        if turns.rem_euclid(4) == 0 {
            return Ok(self.history.pointer());
        }
        let label = match turns.rem_euclid(4) {
            1 => "Rotate right",
            2 => "Rotate 180°",
            _ => "Rotate left",
        };
        self.commit(transform::rotate_quarter_turns(&image, turns), label)
    }

    pub fn flip(&mut self, horizontal: bool) -> EditResult<usize> {
        self.ensure_idle()?;
        let image = self.require_image()?;
        if horizontal {
            self.commit(transform::flip_horizontal(&image), "Flip horizontal")
        } else {
            self.commit(transform::flip_vertical(&image), "Flip vertical")
        }
    }

    pub fn apply_watermark(&mut self, settings: &WatermarkSettings) -> EditResult<usize> {
        self.ensure_idle()?;
        let image = self.require_image()?;
        let out = watermark::apply(&image, settings);
        if out.shares_pixels_with(&image) {
            return Ok(self.history.pointer());
        }
        self.commit(out, "Watermark")
    }

    /// Key out a flat background color, if one is detected.
    pub fn clean_background(&mut self) -> EditResult<usize> {
        self.ensure_idle()?;
        let image = self.require_image()?;
        let cleaned = clean_foreground(&image, &self.settings.detection);
        if cleaned.shares_pixels_with(&image) {
            return Ok(self.history.pointer());
        }
        self.commit(cleaned, "Clean background")
    }

    /// Clean the current foreground and place it over `fill`.
    pub fn apply_background(&mut self, fill: &BackgroundFill, fit: FitMode) -> EditResult<usize> {
        self.ensure_idle()?;
        let image = self.require_image()?;
        let foreground = clean_foreground(&image, &self.settings.detection);
        let out = composite_onto_background(&foreground, fill, fit);
        self.commit(out, "Background")
    }

    // ========================================================================
    // REMOTE EDITS
    // ========================================================================

    /// Build a localized edit request from the current mask or hotspot and
    /// take the busy lock.
    pub fn begin_remote_edit(&mut self, instruction: &str) -> EditResult<PendingEdit> {
        self.ensure_idle()?;
        let image = self.require_image()?;
        let mask = if self.tools.mask.is_empty() {
            None
        } else {
            Some(self.tools.mask.export_binary_mask(image.width(), image.height()))
        };
        let target = EditTarget::choose(mask, self.tools.hotspot.map(|h| h.natural)).ok_or(EditError::NoSelection)?;
        let label = format!("Edit ({}): {}", target.kind(), instruction.trim());
        Ok(self.take_ticket(image, instruction, target, label, PendingKind::Replace))
    }

    /// Ask the model to cut out the subject.
    pub fn begin_background_removal(&mut self) -> EditResult<PendingEdit> {
        self.ensure_idle()?;
        let image = self.require_image()?;
        Ok(self.take_ticket(
            image,
            "remove the background",
            EditTarget::WholeImage,
            "Remove background".to_string(),
            PendingKind::CleanForeground,
        ))
    }

    /// Ask the model for a new background described by `prompt`.
    pub fn begin_background_generation(&mut self, prompt: &str, fit: FitMode) -> EditResult<PendingEdit> {
        self.ensure_idle()?;
        let image = self.require_image()?;
        Ok(self.take_ticket(
            image,
            prompt,
            EditTarget::WholeImage,
            format!("Generated background: {}", prompt.trim()),
            PendingKind::BackgroundFill(fit),
        ))
    }

    fn take_ticket(
        &mut self,
        image: RasterImage,
        instruction: &str,
        target: EditTarget,
        label: String,
        kind: PendingKind,
    ) -> PendingEdit {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.in_flight = Some(ticket);
        info!(ticket, target = target.kind(), "edit request started");
        PendingEdit {
            ticket,
            request: EditRequest {
                image,
                instruction: instruction.to_string(),
                target,
            },
            label,
            kind,
        }
    }

    /// Apply the collaborator's answer and release the busy lock.
    ///
    /// Answers are applied even if the user switched tools meanwhile. On
    /// failure the history is left untouched.
    pub fn finish_remote_edit(
        &mut self,
        pending: PendingEdit,
        result: Result<RasterImage, GenerateError>,
    ) -> EditResult<usize> {
        if self.in_flight == Some(pending.ticket) {
            self.in_flight = None;
        } else {
            warn!(ticket = pending.ticket, "finishing an edit that does not hold the lock");
        }

        let raster = match result {
            Ok(raster) if raster.is_empty() => return Err(GenerateError::NoImage.into()),
            Ok(raster) => raster,
            Err(e) => {
                warn!(ticket = pending.ticket, error = %e, "edit request failed");
                return Err(e.into());
            }
        };

        let out = match pending.kind {
            PendingKind::Replace => raster,
            PendingKind::CleanForeground => clean_foreground(&raster, &self.settings.detection),
            PendingKind::BackgroundFill(fit) => {
                let foreground = clean_foreground(&pending.request.image, &self.settings.detection);
                composite_onto_background(&foreground, &BackgroundFill::Generated(raster), fit)
            }
        };
        self.commit(out, pending.label)
    }

    /// Drop a request without applying anything and release the busy lock.
    pub fn abandon_remote_edit(&mut self, pending: PendingEdit) {
        if self.in_flight == Some(pending.ticket) {
            self.in_flight = None;
            info!(ticket = pending.ticket, "edit request abandoned");
        } else {
            warn!(ticket = pending.ticket, "abandoning an edit that does not hold the lock");
        }
    }

    /// Send the request and apply the answer in one call.
    pub fn run_remote_edit(&mut self, pending: PendingEdit, generator: &dyn EditGenerator) -> EditResult<usize> {
        let result = generator.edit(&pending.request);
        self.finish_remote_edit(pending, result)
    }

    // ========================================================================
    // SESSION
    // ========================================================================

    pub fn save_descriptor(&mut self) -> EditResult<()> {
        let tool = self.active_tool.name();
        self.history.save_session_descriptor(tool, &self.prompt)?;
        Ok(())
    }

    /// Descriptor writes after navigation are best effort.
    fn persist_descriptor(&mut self) {
        if let Err(e) = self.save_descriptor() {
            warn!(error = %e, "failed to save session descriptor");
        }
    }

    /// Reload history, tool and prompt from the store.
    ///
    /// Returns `Ok(false)` when there is no stored session. A corrupt session
    /// is wiped and reported as `CorruptSession`; the project is then empty
    /// and ready for a new upload.
    pub fn restore_session(&mut self) -> EditResult<bool> {
        self.tools.reset();
        let descriptor = match self.history.load_session_descriptor() {
            Ok(Some(d)) => d,
            Ok(None) => return Ok(false),
            Err(e) => {
                warn!(error = %e, "unreadable session descriptor");
                if let Err(e) = self.history.clear() {
                    warn!(error = %e, "failed to clear unreadable session");
                }
                return Err(EditError::CorruptSession { expected: 0, found: 0 });
            }
        };
        self.history.restore_session(&descriptor)?;
        self.active_tool = ToolKind::from_name(&descriptor.active_tool).unwrap_or_default();
        self.prompt = descriptor.prompt;
        self.refresh_layout();
        self.sync_mask_size();
        Ok(!self.history.is_empty())
    }

    // ========================================================================
    // EXPORT
    // ========================================================================

    pub fn export(&self, format: ExportFormat, quality: u8) -> EditResult<Vec<u8>> {
        let image = self.history.current().ok_or(EditError::NoImage)?;
        Ok(io::encode(image, format, quality)?)
    }

    pub fn estimate_export_size(&self, format: ExportFormat, quality: u8) -> EditResult<usize> {
        let image = self.history.current().ok_or(EditError::NoImage)?;
        Ok(io::estimate_encoded_size(image, format, quality)?)
    }

    pub fn export_to(&self, path: &Path, format: ExportFormat, quality: u8) -> EditResult<()> {
        let image = self.history.current().ok_or(EditError::NoImage)?;
        io::encode_and_write(image, path, format, quality)?;
        info!(path = %path.display(), format = format.extension(), "exported");
        Ok(())
    }
}
