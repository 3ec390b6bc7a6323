//! Off-thread chart rasterizer.
//!
//! The worker thread owns the [`Surface`] from `INIT` until `TEARDOWN` hands
//! it back; callers only ever see replies. State machine:
//! `uninitialized → ready → drawing → ready → … → torn down`.

use crate::error::AppError;
use crate::market::types::UiCandle;
use parking_lot::Mutex;
use plotters::drawing::DrawingAreaErrorKind;
use plotters::prelude::*;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use tokio::sync::{mpsc, oneshot, watch};

const PRICE_PANE_RATIO: f64 = 0.75;
const VOLUME_PANE_TOP_RATIO: f64 = 0.80;
const PRICE_PADDING_RATIO: f64 = 0.05;
const CANDLE_BODY_RATIO: f64 = 0.6;
const GRID_DIVISIONS: u32 = 4;
const MAX_SURFACE_SIDE: f64 = 16_384.0;
/// 8K UHD. Larger backing stores are refused instead of allocated.
const MAX_SURFACE_PIXELS: u64 = 7_680 * 4_320;

const BACKGROUND: RGBColor = RGBColor(16, 18, 27);
const GRID: RGBColor = RGBColor(38, 42, 56);
const BULLISH: RGBColor = RGBColor(38, 166, 154);
const BEARISH: RGBColor = RGBColor(239, 83, 80);
const SERIES: RGBColor = RGBColor(41, 98, 255);
const CROSSHAIR: RGBColor = RGBColor(200, 204, 214);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChartMode {
    #[default]
    Line,
    Area,
    Candles,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub css_width: f64,
    pub css_height: f64,
    pub device_pixel_ratio: f64,
}

impl Viewport {
    /// Backing-store size in device pixels.
    pub fn pixel_size(&self) -> Result<(u32, u32), AppError> {
        let valid = |value: f64| value.is_finite() && value > 0.0;
        if !valid(self.css_width) || !valid(self.css_height) || !valid(self.device_pixel_ratio) {
            return Err(AppError::Render(
                "viewport dimensions must be finite and positive".to_string(),
            ));
        }
        let scale = |css: f64| {
            (css * self.device_pixel_ratio)
                .round()
                .clamp(1.0, MAX_SURFACE_SIDE) as u32
        };
        let (width, height) = (scale(self.css_width), scale(self.css_height));
        if u64::from(width) * u64::from(height) > MAX_SURFACE_PIXELS {
            return Err(AppError::Render(format!(
                "{width}x{height} device pixels exceeds the {MAX_SURFACE_PIXELS} pixel budget"
            )));
        }
        Ok((width, height))
    }
}

/// Crosshair position in CSS pixels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Crosshair {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrawCommand {
    pub data: Vec<UiCandle>,
    pub viewport: Viewport,
    pub mode: ChartMode,
    pub crosshair: Option<Crosshair>,
}

/// RGB backing store, row-major, three bytes per device pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct Surface {
    width: u32,
    height: u32,
    device_pixel_ratio: f64,
    pixels: Vec<u8>,
}

impl Surface {
    pub fn new(width: u32, height: u32, device_pixel_ratio: f64) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        Self {
            width,
            height,
            device_pixel_ratio,
            pixels: vec![0; width as usize * height as usize * 3],
        }
    }

    pub fn for_viewport(viewport: &Viewport) -> Result<Self, AppError> {
        let (width, height) = viewport.pixel_size()?;
        Ok(Self::new(width, height, viewport.device_pixel_ratio))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn device_pixel_ratio(&self) -> f64 {
        self.device_pixel_ratio
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        Some([
            self.pixels[offset],
            self.pixels[offset + 1],
            self.pixels[offset + 2],
        ])
    }

    /// Returns `true` when the backing store had to be reallocated.
    fn resize_to(&mut self, width: u32, height: u32, device_pixel_ratio: f64) -> bool {
        self.device_pixel_ratio = device_pixel_ratio;
        if self.width == width && self.height == height {
            return false;
        }
        self.width = width;
        self.height = height;
        self.pixels = vec![0; width as usize * height as usize * 3];
        true
    }
}

/// Data-space to device-pixel transforms for one frame. Prices occupy the
/// top pane, volume the bottom one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChartScale {
    pub width: u32,
    pub height: u32,
    pub count: usize,
    pub min_price: f64,
    pub max_price: f64,
    pub max_volume: f64,
}

impl ChartScale {
    pub fn from_data(data: &[UiCandle], width: u32, height: u32) -> Option<Self> {
        if data.is_empty() || width == 0 || height == 0 {
            return None;
        }

        let (low, high) = data
            .iter()
            .flat_map(|candle| [candle.l, candle.h, candle.o, candle.c])
            .filter(|price| price.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(low, high), price| {
                (low.min(price), high.max(price))
            });
        if !low.is_finite() || !high.is_finite() {
            return None;
        }

        let span = high - low;
        let padding = if span > 0.0 {
            span * PRICE_PADDING_RATIO
        } else {
            (high.abs() * 0.01).max(1.0)
        };
        let max_volume = data
            .iter()
            .map(|candle| candle.v)
            .filter(|volume| volume.is_finite())
            .fold(0.0_f64, f64::max);

        Some(Self {
            width,
            height,
            count: data.len(),
            min_price: low - padding,
            max_price: high + padding,
            max_volume: if max_volume > 0.0 { max_volume } else { 1.0 },
        })
    }

    pub fn slot_width(&self) -> f64 {
        self.width as f64 / self.count as f64
    }

    pub fn x_center(&self, index: usize) -> f64 {
        (index as f64 + 0.5) * self.slot_width()
    }

    pub fn price_pane_height(&self) -> f64 {
        self.height as f64 * PRICE_PANE_RATIO
    }

    pub fn y_for_price(&self, price: f64) -> f64 {
        let ratio = (self.max_price - price) / (self.max_price - self.min_price);
        ratio * self.price_pane_height()
    }

    pub fn y_for_volume(&self, volume: f64) -> f64 {
        let bottom = self.height as f64;
        let pane = bottom - self.height as f64 * VOLUME_PANE_TOP_RATIO;
        bottom - (volume.max(0.0) / self.max_volume).min(1.0) * pane
    }
}

fn px(value: f64) -> i32 {
    value.round() as i32
}

fn render_error<E>(error: DrawingAreaErrorKind<E>) -> AppError
where
    E: std::error::Error + Send + Sync,
{
    AppError::Render(error.to_string())
}

fn paint_frame(surface: &mut Surface, command: &DrawCommand) -> Result<bool, AppError> {
    let (width, height) = command.viewport.pixel_size()?;
    let resized = surface.resize_to(width, height, command.viewport.device_pixel_ratio);
    let line_width = command.viewport.device_pixel_ratio.round().max(1.0) as u32;
    let scale = ChartScale::from_data(&command.data, width, height);

    let root = BitMapBackend::with_buffer(&mut surface.pixels, (width, height)).into_drawing_area();

    root.fill(&BACKGROUND).map_err(render_error)?;

    let price_pane = height as f64 * PRICE_PANE_RATIO;
    for division in 1..GRID_DIVISIONS {
        let y = px(price_pane * division as f64 / GRID_DIVISIONS as f64);
        root.draw(&PathElement::new(vec![(0, y), (width as i32, y)], GRID))
            .map_err(render_error)?;
    }

    if let Some(scale) = scale {
        let body_width = (scale.slot_width() * CANDLE_BODY_RATIO).max(1.0);

        for (index, candle) in command.data.iter().enumerate() {
            let color = if candle.is_bullish() { BULLISH } else { BEARISH };
            let center = scale.x_center(index);
            root.draw(&Rectangle::new(
                [
                    (px(center - body_width / 2.0), px(scale.y_for_volume(candle.v))),
                    (px(center + body_width / 2.0), height as i32),
                ],
                color.mix(0.45).filled(),
            ))
            .map_err(render_error)?;
        }

        let closes: Vec<(i32, i32)> = command
            .data
            .iter()
            .enumerate()
            .map(|(index, candle)| (px(scale.x_center(index)), px(scale.y_for_price(candle.c))))
            .collect();

        match command.mode {
            ChartMode::Line => {
                root.draw(&PathElement::new(closes, SERIES.stroke_width(line_width)))
                    .map_err(render_error)?;
            }
            ChartMode::Area => {
                let baseline = px(price_pane);
                let mut outline = closes.clone();
                if let (Some(first), Some(last)) = (closes.first(), closes.last()) {
                    outline.push((last.0, baseline));
                    outline.push((first.0, baseline));
                }
                root.draw(&Polygon::new(outline, SERIES.mix(0.25).filled()))
                    .map_err(render_error)?;
                root.draw(&PathElement::new(closes, SERIES.stroke_width(line_width)))
                    .map_err(render_error)?;
            }
            ChartMode::Candles => {
                for (index, candle) in command.data.iter().enumerate() {
                    let color = if candle.is_bullish() { BULLISH } else { BEARISH };
                    let center = px(scale.x_center(index));
                    root.draw(&PathElement::new(
                        vec![
                            (center, px(scale.y_for_price(candle.h))),
                            (center, px(scale.y_for_price(candle.l))),
                        ],
                        color.stroke_width(line_width),
                    ))
                    .map_err(render_error)?;

                    let body_top = scale.y_for_price(candle.o.max(candle.c));
                    let body_bottom = scale.y_for_price(candle.o.min(candle.c)).max(body_top + 1.0);
                    let half_body = body_width / 2.0;
                    root.draw(&Rectangle::new(
                        [
                            (px(scale.x_center(index) - half_body), px(body_top)),
                            (px(scale.x_center(index) + half_body), px(body_bottom)),
                        ],
                        color.filled(),
                    ))
                    .map_err(render_error)?;
                }
            }
        }
    }

    if let Some(crosshair) = command.crosshair {
        let x = px(crosshair.x * command.viewport.device_pixel_ratio);
        let y = px(crosshair.y * command.viewport.device_pixel_ratio);
        root.draw(&PathElement::new(vec![(x, 0), (x, height as i32)], CROSSHAIR))
            .map_err(render_error)?;
        root.draw(&PathElement::new(vec![(0, y), (width as i32, y)], CROSSHAIR))
            .map_err(render_error)?;
    }

    root.present().map_err(render_error)?;
    Ok(resized)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderState {
    Uninitialized,
    Ready,
    Drawing,
    TornDown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RenderOutcome {
    Drawn {
        sequence: u64,
        width: u32,
        height: u32,
        resized: bool,
    },
    Degraded {
        reason: String,
    },
}

enum RenderCommand {
    Init {
        surface: Surface,
        reply: oneshot::Sender<RenderReply>,
    },
    Draw {
        sequence: u64,
        command: Box<DrawCommand>,
        reply: oneshot::Sender<RenderReply>,
    },
    Teardown {
        reply: oneshot::Sender<RenderReply>,
    },
}

#[derive(Debug)]
enum RenderReply {
    Ready,
    Drawn {
        sequence: u64,
        width: u32,
        height: u32,
        resized: bool,
    },
    Released(Option<Surface>),
    Failed {
        reason: String,
    },
}

fn render_main(
    mut commands: mpsc::UnboundedReceiver<RenderCommand>,
    state: watch::Sender<RenderState>,
) {
    let mut surface: Option<Surface> = None;

    while let Some(message) = commands.blocking_recv() {
        match message {
            RenderCommand::Init {
                surface: incoming,
                reply,
            } => {
                surface = Some(incoming);
                state.send_replace(RenderState::Ready);
                let _ = reply.send(RenderReply::Ready);
            }
            RenderCommand::Draw {
                sequence,
                command,
                reply,
            } => {
                let Some(target) = surface.as_mut() else {
                    let _ = reply.send(RenderReply::Failed {
                        reason: "surface not initialized".to_string(),
                    });
                    continue;
                };

                state.send_replace(RenderState::Drawing);
                let painted =
                    panic::catch_unwind(AssertUnwindSafe(|| paint_frame(target, &command)));
                state.send_replace(RenderState::Ready);

                let response = match painted {
                    Ok(Ok(resized)) => RenderReply::Drawn {
                        sequence,
                        width: target.width,
                        height: target.height,
                        resized,
                    },
                    Ok(Err(error)) => RenderReply::Failed {
                        reason: error.to_string(),
                    },
                    Err(_) => RenderReply::Failed {
                        reason: "painter panicked".to_string(),
                    },
                };
                let _ = reply.send(response);
            }
            RenderCommand::Teardown { reply } => {
                state.send_replace(RenderState::TornDown);
                let _ = reply.send(RenderReply::Released(surface.take()));
                break;
            }
        }
    }

    state.send_replace(RenderState::TornDown);
}

pub struct RenderWorker {
    commands: mpsc::UnboundedSender<RenderCommand>,
    state: watch::Receiver<RenderState>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    next_sequence: AtomicU64,
}

impl RenderWorker {
    pub fn spawn() -> Result<Self, AppError> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RenderState::Uninitialized);
        let thread = thread::Builder::new()
            .name("render-worker".to_string())
            .spawn(move || render_main(commands_rx, state_tx))?;

        Ok(Self {
            commands: commands_tx,
            state: state_rx,
            thread: Mutex::new(Some(thread)),
            next_sequence: AtomicU64::new(1),
        })
    }

    pub fn state(&self) -> RenderState {
        *self.state.borrow()
    }

    async fn roundtrip<F>(&self, build: F) -> Result<RenderReply, AppError>
    where
        F: FnOnce(oneshot::Sender<RenderReply>) -> RenderCommand,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .map_err(|_| AppError::WorkerUnavailable("render worker stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| AppError::WorkerUnavailable("render worker dropped reply".to_string()))
    }

    /// Moves `surface` into the worker.
    pub async fn init(&self, surface: Surface) -> Result<(), AppError> {
        match self
            .roundtrip(|reply| RenderCommand::Init { surface, reply })
            .await?
        {
            RenderReply::Ready => Ok(()),
            other => Err(AppError::Render(format!("unexpected init reply: {other:?}"))),
        }
    }

    /// Never fails outright: an unavailable worker or surface comes back as
    /// [`RenderOutcome::Degraded`].
    pub async fn draw(&self, command: DrawCommand) -> RenderOutcome {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let reply = self
            .roundtrip(|reply| RenderCommand::Draw {
                sequence,
                command: Box::new(command),
                reply,
            })
            .await;

        match reply {
            Ok(RenderReply::Drawn {
                sequence,
                width,
                height,
                resized,
            }) => RenderOutcome::Drawn {
                sequence,
                width,
                height,
                resized,
            },
            Ok(RenderReply::Failed { reason }) => {
                tracing::warn!(sequence, %reason, "chart draw degraded");
                RenderOutcome::Degraded { reason }
            }
            Ok(other) => RenderOutcome::Degraded {
                reason: format!("unexpected draw reply: {other:?}"),
            },
            Err(error) => {
                tracing::warn!(sequence, %error, "chart draw degraded");
                RenderOutcome::Degraded {
                    reason: error.to_string(),
                }
            }
        }
    }

    /// Stops the worker and hands the surface back if one was attached.
    pub async fn teardown(&self) -> Option<Surface> {
        let released = match self
            .roundtrip(|reply| RenderCommand::Teardown { reply })
            .await
        {
            Ok(RenderReply::Released(surface)) => surface,
            _ => None,
        };

        let maybe_thread = self.thread.lock().take();
        if let Some(thread) = maybe_thread {
            if let Ok(Err(_)) = tokio::task::spawn_blocking(move || thread.join()).await {
                tracing::warn!("render worker panicked during teardown");
            }
        }
        released
    }
}
